//! Run captcha attempts in child processes, one at a time, with retries.
//!
//! A solver process prints exactly one [`FetchResult`] line on stdout and
//! logs to stderr. Each solver leads its own process group; once it exits or
//! runs out of wall-clock time the whole group is killed, so a browser it
//! left behind can neither outlive the attempt nor hold its pipes open.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{FetchResult, RedemptionToken};
use crate::config::IsolationConfig;

pub const SOLVER_BIN: &str = "dkb-captcha-token";

/// Solver stderr lines repeated at warn level when an attempt fails.
const STDERR_TAIL: usize = 10;

/// How long to keep reading a solver's pipes once it has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One try at getting a token.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based.
    pub index: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(RedemptionToken),
    Failure(String),
    Timeout(Duration),
}

/// Why the last attempt failed once retries are used up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("captcha attempt {attempt} failed: {reason}")]
    Failed { attempt: u32, reason: String },

    #[error("captcha attempt {attempt} timed out after {limit:?}")]
    TimedOut { attempt: u32, limit: Duration },

    #[error("no captcha attempts allowed (max_retries = 0)")]
    NoAttempts,
}

impl From<&AttemptError> for FetchResult {
    fn from(err: &AttemptError) -> Self {
        FetchResult::failure(err.to_string())
    }
}

/// Runs a single attempt to completion. Implementations must not panic or
/// hang past their own limit; every problem is an outcome.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(&self, attempt: &Attempt) -> AttemptOutcome;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IsolationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            cooldown: config.cooldown,
        }
    }

    /// Run attempts strictly one after another until one succeeds or
    /// `max_retries` have been made, sleeping `cooldown` in between.
    pub async fn run<R>(&self, runner: &R) -> Result<RedemptionToken, AttemptError>
    where
        R: AttemptRunner + ?Sized,
    {
        let mut last_error = AttemptError::NoAttempts;

        for index in 1..=self.max_retries {
            let attempt = Attempt {
                index,
                max_attempts: self.max_retries,
                started_at: Utc::now(),
            };
            info!(attempt = index, max = self.max_retries, "captcha attempt");

            last_error = match runner.run_attempt(&attempt).await {
                AttemptOutcome::Success(token) => {
                    info!(attempt = index, token_len = token.len(), "got captcha token");
                    return Ok(token);
                }
                AttemptOutcome::Failure(reason) => {
                    warn!(attempt = index, %reason, "captcha attempt failed");
                    AttemptError::Failed {
                        attempt: index,
                        reason,
                    }
                }
                AttemptOutcome::Timeout(limit) => {
                    warn!(attempt = index, ?limit, "captcha attempt timed out");
                    AttemptError::TimedOut {
                        attempt: index,
                        limit,
                    }
                }
            };

            if index < self.max_retries {
                info!(cooldown = ?self.cooldown, "retrying captcha");
                tokio::time::sleep(self.cooldown).await;
            }
        }

        warn!(attempts = self.max_retries, "failed to get captcha token");
        Err(last_error)
    }
}

/// Spawns the solver executable for every attempt.
#[derive(Debug, Clone)]
pub struct IsolatedRunner {
    program: PathBuf,
    args: Vec<String>,
    wall_clock_timeout: Duration,
}

impl IsolatedRunner {
    pub fn new(program: impl Into<PathBuf>, wall_clock_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            wall_clock_timeout,
        }
    }

    /// Runner for the configured solver, or the `dkb-captcha-token` binary
    /// installed beside the current executable.
    pub fn from_config(config: &IsolationConfig) -> Result<Self> {
        let program = match &config.solver_path {
            Some(path) => path.clone(),
            None => default_solver_path()?,
        };
        Ok(Self::new(program, config.attempt_timeout))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl AttemptRunner for IsolatedRunner {
    async fn run_attempt(&self, attempt: &Attempt) -> AttemptOutcome {
        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The solver and the browser it launches share one group, so the
        // whole tree can be signalled at once.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut command = Command::from(command);
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::Failure(format!(
                    "failed to start solver {}: {e}",
                    self.program.display()
                ))
            }
        };
        let pid = child.id();
        debug!(attempt = attempt.index, ?pid, "solver started");

        let stdout = PipeCapture::start(child.stdout.take());
        let stderr = PipeCapture::start(child.stderr.take());

        // Only the solver's own exit is awaited. Pipes can stay open for as
        // long as a stray descendant holds them.
        let waited = tokio::time::timeout(self.wall_clock_timeout, child.wait()).await;
        kill_process_group(pid);

        let status = match waited {
            Err(_) => {
                if let Err(e) = child.kill().await {
                    debug!(attempt = attempt.index, error = %e, "solver already gone");
                }
                stdout.abort();
                let stderr = stderr.finish(DRAIN_GRACE).await;
                log_stderr(attempt, &String::from_utf8_lossy(&stderr), false);
                return AttemptOutcome::Timeout(self.wall_clock_timeout);
            }
            Ok(Err(e)) => {
                return AttemptOutcome::Failure(format!("failed to wait for solver: {e}"))
            }
            Ok(Ok(status)) => status,
        };

        let stdout = stdout.finish(DRAIN_GRACE).await;
        let stderr = stderr.finish(DRAIN_GRACE).await;

        let stdout = String::from_utf8_lossy(&stdout);
        let outcome = match (status.success(), FetchResult::from_output(&stdout)) {
            (true, Ok(FetchResult::Success { token })) => {
                AttemptOutcome::Success(RedemptionToken::new(token))
            }
            (_, Ok(FetchResult::Failure { error })) => AttemptOutcome::Failure(error),
            (false, Ok(FetchResult::Success { .. })) => AttemptOutcome::Failure(format!(
                "solver reported a token but exited with {status}"
            )),
            (_, Err(e)) => AttemptOutcome::Failure(format!("{e} ({status})")),
        };

        let succeeded = matches!(outcome, AttemptOutcome::Success(_));
        log_stderr(attempt, &String::from_utf8_lossy(&stderr), succeeded);
        outcome
    }
}

/// Everything a pipe delivers, kept even if reading is cut short.
struct PipeCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buf, task }
    }

    fn abort(self) {
        self.task.abort();
    }

    /// Wait up to `grace` for end of file, then return what was read.
    async fn finish(self, grace: Duration) -> Vec<u8> {
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("solver pipe still open after exit; output may be truncated");
            task.abort();
        }
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buf)
    }
}

/// Debug-log solver stderr; on failure the last lines are repeated at warn.
fn log_stderr(attempt: &Attempt, stderr: &str, succeeded: bool) {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail_from = if succeeded {
        lines.len()
    } else {
        lines.len().saturating_sub(STDERR_TAIL)
    };
    for (i, line) in lines.iter().enumerate() {
        if i < tail_from {
            debug!(attempt = attempt.index, "solver: {line}");
        } else {
            warn!(attempt = attempt.index, "solver: {line}");
        }
    }
}

/// SIGKILL the solver's process group. Whatever is left after the solver
/// exits or times out is an orphaned browser.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal and touches no memory.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pgid, "killed solver process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

fn default_solver_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Could not locate current executable")?;
    let dir = exe
        .parent()
        .context("Current executable has no parent directory")?;
    Ok(dir.join(format!("{SOLVER_BIN}{}", std::env::consts::EXE_SUFFIX)))
}
