//! Drive the login page until the captcha provider hands out a token.
//!
//! The widget UI is flaky: it sometimes needs a reload to appear and some
//! variants start solving without a click. UI interaction is therefore best
//! effort, and the redemption response seen on the network is the only
//! success signal.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use super::protocol::RedemptionToken;
use super::tap::NetworkEventTap;
use crate::config::CaptchaConfig;

/// The browser operations the acquirer needs from a loaded login page.
#[async_trait]
pub trait ChallengePage: Send + Sync {
    /// Click away the cookie-consent overlay. `Ok(false)` if it isn't shown.
    async fn dismiss_consent_banner(&self) -> Result<bool>;

    /// Whether the widget's frame is present in the page.
    async fn widget_visible(&self) -> Result<bool>;

    /// Click the widget's activation control. `Ok(false)` if it isn't ready.
    async fn click_widget(&self) -> Result<bool>;

    async fn reload(&self) -> Result<()>;

    /// Fetch the (decoded) body of a captured response.
    async fn response_body(&self, request_id: &str) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timeout: no redeem token response after {0:?}")]
    TokenTimeout(Duration),

    #[error("could not extract redeem token from response: {0}")]
    MalformedRedemption(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl From<anyhow::Error> for AcquireError {
    fn from(err: anyhow::Error) -> Self {
        Self::Browser(format!("{err:#}"))
    }
}

/// Captcha acquisition loop for one browser session.
#[derive(Debug, Clone)]
pub struct ChallengeTokenAcquirer {
    timeout: Duration,
    max_rounds: u32,
    poll_interval: Duration,
}

impl ChallengeTokenAcquirer {
    pub fn new(timeout: Duration, max_rounds: u32, poll_interval: Duration) -> Self {
        Self {
            timeout,
            max_rounds,
            poll_interval,
        }
    }

    pub fn from_config(config: &CaptchaConfig) -> Self {
        Self::new(config.timeout, config.max_rounds, config.poll_interval)
    }

    /// Engage the widget, then wait for a redemption response and extract
    /// its token.
    pub async fn acquire<P>(
        &self,
        page: &P,
        tap: &NetworkEventTap,
    ) -> Result<RedemptionToken, AcquireError>
    where
        P: ChallengePage + ?Sized,
    {
        self.engage_widget(page, tap).await?;

        let Some(event) = self.wait_for_redemption(tap).await else {
            error!("Timeout: redeem token request not found");
            return Err(AcquireError::TokenTimeout(self.timeout));
        };

        debug!(request_id = %event.request_id, "redeem token response found");
        let body = page.response_body(&event.request_id).await?;
        let token = extract_redeem_token(&body)?;
        info!(token_len = token.len(), "captcha solved");
        Ok(token)
    }

    /// Reload/click rounds. Running out of rounds is fine: some widget
    /// variants solve without a click.
    async fn engage_widget<P>(&self, page: &P, tap: &NetworkEventTap) -> Result<(), AcquireError>
    where
        P: ChallengePage + ?Sized,
    {
        for round in 1..=self.max_rounds {
            if tap.activation_count() > 0 {
                debug!(round, "captcha activated without a click");
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval).await;
            debug!(round, "trying to click captcha button");

            match page.dismiss_consent_banner().await {
                Ok(true) => debug!("dismissed cookie banner"),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "cookie banner not dismissed"),
            }

            if !page.widget_visible().await.unwrap_or(false) {
                debug!(round, "did not find captcha widget, reloading");
                page.reload().await?;
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            match page.click_widget().await {
                Ok(true) => {
                    info!(round, "clicked on captcha");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "captcha click failed"),
            }
        }

        debug!(rounds = self.max_rounds, "widget rounds exhausted");
        Ok(())
    }

    /// Poll the tap once per interval until a redemption shows up or the
    /// whole timeout has been waited out.
    async fn wait_for_redemption(&self, tap: &NetworkEventTap) -> Option<super::tap::NetworkEvent> {
        let checks = if self.poll_interval.is_zero() {
            0
        } else {
            self.timeout.as_millis().div_ceil(self.poll_interval.as_millis())
        };

        let mut waited = 0u128;
        loop {
            if let Some(event) = tap.latest_redemption() {
                return Some(event);
            }
            if waited >= checks {
                return None;
            }
            debug!("still waiting for captcha solving");
            tokio::time::sleep(self.poll_interval).await;
            waited += 1;
        }
    }
}

fn extract_redeem_token(body: &str) -> Result<RedemptionToken, AcquireError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AcquireError::MalformedRedemption(e.to_string()))?;

    match value.pointer("/data/redeem_token").and_then(Value::as_str) {
        Some(token) if !token.is_empty() => Ok(RedemptionToken::new(token)),
        _ => Err(AcquireError::MalformedRedemption(
            "missing data.redeem_token".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::tap::UrlPredicates;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const QUOTE: &str = "https://eu.frcapi.com/api/v2/captcha/quote";
    const REDEEM: &str = "https://eu.frcapi.com/api/v2/captcha/redeem";

    fn tap() -> NetworkEventTap {
        NetworkEventTap::new(UrlPredicates::new(QUOTE, REDEEM))
    }

    fn body(token: &str) -> String {
        format!(r#"{{"data":{{"redeem_token":"{token}"}}}}"#)
    }

    #[derive(Default)]
    struct FakePage {
        widget_visible: bool,
        click_works: bool,
        reload_fails: bool,
        bodies: HashMap<String, String>,
        clicks: AtomicUsize,
        reloads: AtomicUsize,
    }

    #[async_trait]
    impl ChallengePage for FakePage {
        async fn dismiss_consent_banner(&self) -> Result<bool> {
            anyhow::bail!("no banner")
        }

        async fn widget_visible(&self) -> Result<bool> {
            Ok(self.widget_visible)
        }

        async fn click_widget(&self) -> Result<bool> {
            self.clicks.fetch_add(1, Ordering::SeqCst);
            Ok(self.click_works)
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.reload_fails {
                anyhow::bail!("target closed");
            }
            Ok(())
        }

        async fn response_body(&self, request_id: &str) -> Result<String> {
            self.bodies
                .get(request_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no body for {request_id}"))
        }
    }

    fn clickable_page() -> FakePage {
        FakePage {
            widget_visible: true,
            click_works: true,
            bodies: HashMap::from([("r1".to_string(), body("abc123"))]),
            ..Default::default()
        }
    }

    fn acquirer(timeout_secs: u64) -> ChallengeTokenAcquirer {
        ChallengeTokenAcquirer::new(Duration::from_secs(timeout_secs), 50, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_token_as_soon_as_redemption_arrives() {
        let page = clickable_page();
        let tap = tap();
        let producer = tap.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            producer.observe(REDEEM, "r1");
        });

        let start = Instant::now();
        let token = acquirer(400).acquire(&page, &tap).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(token.into_inner(), "abc123");
        assert_eq!(page.clicks.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_only_after_full_budget() {
        let page = clickable_page();
        let tap = tap();

        let start = Instant::now();
        let err = acquirer(10).acquire(&page, &tap).await.unwrap_err();

        assert!(matches!(err, AcquireError::TokenTimeout(d) if d == Duration::from_secs(10)));
        // one UI round, then the whole wait budget
        assert!(start.elapsed() >= Duration::from_secs(11), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_activation_skips_the_click() {
        let page = clickable_page();
        let tap = tap();
        tap.observe(QUOTE, "q1");
        tap.observe(REDEEM, "r1");

        let token = acquirer(5).acquire(&page, &tap).await.unwrap();
        assert_eq!(token.into_inner(), "abc123");
        assert_eq!(page.clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_widget_reloads_each_round_and_still_waits() {
        let page = FakePage {
            widget_visible: false,
            ..clickable_page()
        };
        let tap = tap();
        tap.observe(REDEEM, "r1");

        let acquirer =
            ChallengeTokenAcquirer::new(Duration::from_secs(5), 3, Duration::from_secs(1));
        let token = acquirer.acquire(&page, &tap).await.unwrap();

        assert_eq!(token.into_inner(), "abc123");
        assert_eq!(page.reloads.load(Ordering::SeqCst), 3);
        assert_eq!(page.clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn last_redemption_wins() {
        let mut page = clickable_page();
        page.bodies.insert("r2".to_string(), body("second"));
        let tap = tap();
        tap.observe(REDEEM, "r1");
        tap.observe(REDEEM, "r2");

        let token = acquirer(5).acquire(&page, &tap).await.unwrap();
        assert_eq!(token.into_inner(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn browser_failures_become_errors() {
        let page = FakePage {
            widget_visible: false,
            reload_fails: true,
            ..Default::default()
        };
        let err = acquirer(5).acquire(&page, &tap()).await.unwrap_err();
        assert!(matches!(err, AcquireError::Browser(ref msg) if msg.contains("target closed")));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_redemption_body_is_reported() {
        let mut page = clickable_page();
        page.bodies.insert("r1".to_string(), r#"{"data":{}}"#.to_string());
        let tap = tap();
        tap.observe(REDEEM, "r1");

        let err = acquirer(5).acquire(&page, &tap).await.unwrap_err();
        assert!(matches!(err, AcquireError::MalformedRedemption(_)));
    }
}
