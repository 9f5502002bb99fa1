//! Chrome DevTools implementation of [`ChallengePage`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::DescribeNodeParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams, RequestId,
};
use chromiumoxide::cdp::browser_protocol::page::CreateIsolatedWorldParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use super::acquirer::{AcquireError, ChallengePage, ChallengeTokenAcquirer};
use super::protocol::RedemptionToken;
use super::tap::{NetworkEventTap, UrlPredicates};
use crate::config::CaptchaConfig;

const WIDGET_FRAME_SELECTOR: &str = "iframe.frc-i-widget";

const DISMISS_CONSENT_JS: &str = r#"(() => {
    const root = document.querySelector('#usercentrics-cmp-ui');
    const button = root && root.shadowRoot && root.shadowRoot.querySelector('button.uc-accept-button');
    if (!button) return false;
    button.click();
    return true;
})()"#;

// Evaluated inside the widget frame; coordinates are frame-relative.
const CHECKBOX_RECT_JS: &str = r#"(() => {
    const button = document.querySelector('button.checkbox');
    if (!button) return null;
    const r = button.getBoundingClientRect();
    return { x: r.x + r.width / 2, y: r.y + r.height / 2 };
})()"#;

#[derive(Debug, Deserialize)]
struct FramePoint {
    x: f64,
    y: f64,
}

/// Launch a fresh browser, load the login page and run the acquirer.
pub async fn solve(config: &CaptchaConfig) -> Result<RedemptionToken, AcquireError> {
    let profile = tempfile::tempdir().context("Failed to create browser profile dir")?;
    let (mut browser, mut handler) = launch_browser(config, profile.path()).await?;
    let handler_task = tokio::spawn(async move { while (handler.next().await).is_some() {} });

    let result = run_session(&browser, config).await;

    if let Err(e) = browser.close().await {
        debug!(error = %e, "browser close failed");
    }
    handler_task.abort();
    result
}

async fn run_session(
    browser: &Browser,
    config: &CaptchaConfig,
) -> Result<RedemptionToken, AcquireError> {
    let page = browser
        .new_page("about:blank")
        .await
        .context("Failed to open page")?;

    let tap = NetworkEventTap::new(UrlPredicates::new(
        &config.activation_url,
        &config.redemption_url,
    ));
    let tap_task = install_tap(&page, tap.clone()).await?;

    info!(url = %config.login_url, "loading login page");
    page.goto(config.login_url.as_str())
        .await
        .context("Failed to load login page")?;

    let result = ChallengeTokenAcquirer::from_config(config)
        .acquire(&ChromiumChallengePage { page }, &tap)
        .await;

    tap_task.abort();
    result
}

/// Forward every response URL to the tap. The tap itself decides what to keep.
async fn install_tap(page: &Page, tap: NetworkEventTap) -> Result<tokio::task::JoinHandle<()>> {
    page.execute(EnableParams::default()).await?;
    let mut responses = page.event_listener::<EventResponseReceived>().await?;

    Ok(tokio::spawn(async move {
        while let Some(event) = responses.next().await {
            tap.observe(&event.response.url, event.request_id.inner().clone());
        }
    }))
}

struct ChromiumChallengePage {
    page: Page,
}

#[async_trait]
impl ChallengePage for ChromiumChallengePage {
    async fn dismiss_consent_banner(&self) -> Result<bool> {
        let clicked = self
            .page
            .evaluate(DISMISS_CONSENT_JS)
            .await?
            .into_value::<bool>()?;
        Ok(clicked)
    }

    async fn widget_visible(&self) -> Result<bool> {
        Ok(self.page.find_element(WIDGET_FRAME_SELECTOR).await.is_ok())
    }

    async fn click_widget(&self) -> Result<bool> {
        let Ok(frame_element) = self.page.find_element(WIDGET_FRAME_SELECTOR).await else {
            return Ok(false);
        };

        let described = self
            .page
            .execute(DescribeNodeParams {
                backend_node_id: Some(frame_element.backend_node_id),
                ..Default::default()
            })
            .await?;
        let frame_id = described
            .node
            .frame_id
            .clone()
            .context("Widget iframe has no frame id")?;

        let world = self
            .page
            .execute(CreateIsolatedWorldParams::new(frame_id))
            .await?;

        let eval = EvaluateParams::builder()
            .expression(CHECKBOX_RECT_JS)
            .context_id(world.execution_context_id)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build evaluate params: {e}"))?;
        let evaluated = self.page.execute(eval).await?;

        let Some(value) = evaluated.result.result.value.clone() else {
            return Ok(false);
        };
        let Ok(inner) = serde_json::from_value::<FramePoint>(value) else {
            return Ok(false);
        };

        let frame_box = frame_element.bounding_box().await?;
        self.page
            .click(Point::new(frame_box.x + inner.x, frame_box.y + inner.y))
            .await?;
        Ok(true)
    }

    async fn reload(&self) -> Result<()> {
        self.page.reload().await?;
        Ok(())
    }

    async fn response_body(&self, request_id: &str) -> Result<String> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await
            .context("Failed to fetch response body")?;

        if response.base64_encoded {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&response.body)
                .context("Response body is not valid base64")?;
            Ok(String::from_utf8_lossy(&decoded).into_owned())
        } else {
            Ok(response.body.clone())
        }
    }
}

async fn launch_browser(
    config: &CaptchaConfig,
    profile_dir: &Path,
) -> Result<(Browser, chromiumoxide::handler::Handler)> {
    let chrome_path = match &config.chrome_path {
        Some(path) => path.clone(),
        None => find_chrome().context(
            "Chrome/Chromium not found. Install it or set captcha.chrome_path.",
        )?,
    };

    let mut builder = BrowserConfig::builder()
        .chrome_executable(chrome_path)
        .user_data_dir(profile_dir)
        .arg("--disable-blink-features=AutomationControlled")
        // The widget iframe is cross-origin; keep it in the page's process
        // so the page session can reach it.
        .arg("--disable-features=IsolateOrigins,site-per-process")
        .arg("--disable-site-isolation-trials")
        .arg("--disable-infobars")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg(format!("--lang={}", config.locale));
    if !config.headless {
        builder = builder.with_head().viewport(None);
    }

    let browser_config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to configure browser: {e}"))?;

    Browser::launch(browser_config)
        .await
        .context("Failed to launch browser")
}

/// Find Chrome/Chromium on PATH or in well-known install locations.
fn find_chrome() -> Option<PathBuf> {
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/run/current-system/sw/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    candidates
        .into_iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}
