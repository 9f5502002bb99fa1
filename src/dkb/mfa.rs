//! Waiting for the login to be approved in the banking app.
//!
//! The status endpoint is long-polled at a fixed interval. Request failures
//! are not approval failures: they are logged and the next poll goes ahead.
//! Human-facing progress goes to a [`NoticeSink`], never to stdout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::client::DkbClient;
use crate::config::MfaConfig;

/// Progress notices are emitted every this many polls.
const NOTICE_EVERY: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Unknown,
}

impl ChallengeStatus {
    /// Map the API's `verificationStatus`.
    pub fn from_verification_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "processed" => Self::Approved,
            "canceled" | "cancelled" | "rejected" | "denied" | "failed" | "expired" => {
                Self::Rejected
            }
            "pending" | "processing" | "unprocessed" => Self::Pending,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::TimedOut)
    }
}

/// A push challenge sent to a device.
#[derive(Debug, Clone)]
pub struct MfaChallenge {
    pub id: String,
    pub device_name: Option<String>,
    pub status: ChallengeStatus,
    pub poll_count: u32,
}

impl MfaChallenge {
    pub fn new(id: impl Into<String>, device_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            device_name,
            status: ChallengeStatus::Pending,
            poll_count: 0,
        }
    }
}

/// A failed status request. Always transient from the poller's view.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Polling request failed. RC: {0}")]
    Http(u16),

    #[error("error parsing polling response: {0}")]
    Malformed(String),

    #[error("polling transport error: {0}")]
    Transport(String),
}

/// Where challenge status comes from.
#[async_trait]
pub trait ChallengeStatusSource: Send + Sync {
    /// The raw `verificationStatus` of a challenge.
    async fn verification_status(&self, challenge_id: &str) -> Result<String, PollError>;
}

#[async_trait]
impl ChallengeStatusSource for DkbClient {
    async fn verification_status(&self, challenge_id: &str) -> Result<String, PollError> {
        let path = format!("/mfa/mfa/challenges/{}", urlencoding::encode(challenge_id));
        let response = self
            .get(&path)
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Http(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PollError::Malformed(e.to_string()))?;
        body.pointer("/data/attributes/verificationStatus")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PollError::Malformed(body.to_string()))
    }
}

/// Receives human-readable progress while we wait on the human.
pub trait NoticeSink: Send + Sync {
    fn notice(&self, message: &str);
}

/// Writes notices to stderr, keeping stdout free for the result.
#[derive(Debug, Default)]
pub struct StderrNotices;

impl NoticeSink for StderrNotices {
    fn notice(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub max_iterations: u32,
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 24,
            interval: Duration::from_secs(5),
        }
    }
}

impl From<&MfaConfig> for PollerConfig {
    fn from(config: &MfaConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            interval: config.interval,
        }
    }
}

pub struct ApprovalConfirmationPoller {
    config: PollerConfig,
    notices: Arc<dyn NoticeSink>,
}

impl ApprovalConfirmationPoller {
    pub fn new(config: PollerConfig, notices: Arc<dyn NoticeSink>) -> Self {
        Self { config, notices }
    }

    /// Poll until the challenge is approved, rejected, or the poll budget is
    /// used up. Returns the terminal status, which is also stored on the
    /// challenge.
    pub async fn confirm<S>(&self, source: &S, challenge: &mut MfaChallenge) -> ChallengeStatus
    where
        S: ChallengeStatusSource + ?Sized,
    {
        match &challenge.device_name {
            Some(device) => self.notices.notice(&format!(
                "Check your banking app on \"{device}\" and confirm login..."
            )),
            None => self.notices.notice("Check your banking app and confirm login..."),
        }
        let budget = self.config.interval * self.config.max_iterations;
        self.notices.notice(&format!(
            "Waiting for phone approval (up to {}s)...",
            budget.as_secs()
        ));

        while challenge.poll_count < self.config.max_iterations {
            challenge.poll_count += 1;

            match source.verification_status(&challenge.id).await {
                Ok(raw) => {
                    let status = ChallengeStatus::from_verification_status(&raw);
                    debug!(poll = challenge.poll_count, %raw, ?status, "challenge status");
                    challenge.status = status;
                    match status {
                        ChallengeStatus::Approved => {
                            self.notices.notice("Phone approval received!");
                            info!(polls = challenge.poll_count, "login approved");
                            return status;
                        }
                        ChallengeStatus::Rejected => {
                            warn!(polls = challenge.poll_count, %raw, "login rejected on device");
                            return status;
                        }
                        _ => {}
                    }
                }
                Err(e) => error!(poll = challenge.poll_count, "{e}"),
            }

            if challenge.poll_count % NOTICE_EVERY == 0 {
                let waited = self.config.interval * challenge.poll_count;
                self.notices.notice(&format!(
                    "Still waiting for approval... ({}s)",
                    waited.as_secs()
                ));
            }
            tokio::time::sleep(self.config.interval).await;
        }

        warn!(polls = challenge.poll_count, "no approval within poll budget");
        challenge.status = ChallengeStatus::TimedOut;
        ChallengeStatus::TimedOut
    }
}
