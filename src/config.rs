use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::duration::deserialize_duration;

pub const DEFAULT_CONFIG_FILE: &str = "dkb-fetch.toml";

/// Anti-bot challenge settings for a single browser attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    /// Page that embeds the challenge widget.
    pub login_url: String,

    /// Provider response observed when the widget starts solving.
    pub activation_url: String,

    /// Provider response carrying the redemption token.
    pub redemption_url: String,

    /// How long to wait for a redemption response once the widget is engaged.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Run the browser without a window.
    pub headless: bool,

    /// Upper bound on reload/click rounds while looking for the widget.
    pub max_rounds: u32,

    /// Sleep between UI rounds and between redemption checks.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,

    /// Explicit Chrome/Chromium executable. Searched for when unset.
    pub chrome_path: Option<PathBuf>,

    /// Browser UI language.
    pub locale: String,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            login_url: "https://banking.dkb.de/login".to_string(),
            activation_url: "https://eu.frcapi.com/api/v2/captcha/quote".to_string(),
            redemption_url: "https://eu.frcapi.com/api/v2/captcha/redeem".to_string(),
            timeout: Duration::from_secs(400),
            headless: true,
            max_rounds: 50,
            poll_interval: Duration::from_secs(1),
            chrome_path: None,
            locale: "de".to_string(),
        }
    }
}

/// Retry policy around the out-of-process captcha solver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub max_retries: u32,

    #[serde(deserialize_with = "deserialize_duration")]
    pub cooldown: Duration,

    /// Hard wall-clock limit for one solver process.
    #[serde(deserialize_with = "deserialize_duration")]
    pub attempt_timeout: Duration,

    /// Solver executable. Defaults to `dkb-captcha-token` next to the
    /// running binary.
    pub solver_path: Option<PathBuf>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(450),
            solver_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Web frontend, used to bootstrap the session cookies.
    pub banking_url: String,

    /// JSON API root.
    pub api_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            banking_url: "https://banking.dkb.de".to_string(),
            api_url: "https://banking.dkb.de/api".to_string(),
        }
    }
}

/// Push-approval polling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    pub max_iterations: u32,

    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    /// 1-based index into the registered devices; 1 is the preferred one.
    pub device: usize,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 24,
            interval: Duration::from_secs(5),
            device: 1,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub captcha: CaptchaConfig,
    pub isolation: IsolationConfig,
    pub api: ApiConfig,
    pub mfa: MfaConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Reject settings that would turn a bounded wait into a busy loop or an
    /// instant timeout.
    pub fn validate(&self) -> Result<()> {
        if self.captcha.poll_interval.is_zero() {
            anyhow::bail!("captcha.poll_interval must be greater than zero");
        }
        if self.mfa.interval.is_zero() {
            anyhow::bail!("mfa.interval must be greater than zero");
        }
        if self.isolation.attempt_timeout.is_zero() {
            anyhow::bail!("isolation.attempt_timeout must be greater than zero");
        }
        Ok(())
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./dkb-fetch.toml` if it exists in current directory
/// 2. `~/.local/share/dkb-fetch/dkb-fetch.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("dkb-fetch").join(DEFAULT_CONFIG_FILE);
    }

    local_config
}
