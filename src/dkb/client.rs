use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ApiConfig;

const XSRF_COOKIE: &str = "__Host-xsrf";

/// HTTP session against the banking frontend and its JSON API.
///
/// Cookies persist across requests; the XSRF token and, once logged in, the
/// bearer token are attached to every API call.
pub struct DkbClient {
    http: Client,
    jar: Arc<Jar>,
    banking_url: String,
    api_url: String,
    xsrf_token: Option<String>,
    bearer: Option<String>,
}

impl DkbClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0")
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            jar,
            banking_url: config.banking_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            xsrf_token: None,
            bearer: None,
        })
    }

    /// Load the login page to pick up session cookies and the XSRF token.
    pub async fn bootstrap(&mut self) -> Result<()> {
        let login_url = format!("{}/login", self.banking_url);
        let response = self
            .http
            .get(&login_url)
            .send()
            .await
            .context("Failed to open banking session")?;
        debug!(status = %response.status(), "session bootstrap");

        let url = Url::parse(&login_url).context("Invalid banking URL")?;
        self.xsrf_token = self
            .jar
            .cookies(&url)
            .and_then(|header| header.to_str().ok().map(str::to_string))
            .and_then(|header| cookie_value(&header, XSRF_COOKIE));

        if self.xsrf_token.is_none() {
            warn!("no XSRF cookie received; continuing without it");
        }
        Ok(())
    }

    pub(crate) fn set_bearer(&mut self, token: impl Into<String>) {
        self.bearer = Some(token.into());
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.decorate(self.http.get(format!("{}{path}", self.api_url)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.decorate(self.http.post(format!("{}{path}", self.api_url)))
    }

    fn decorate(&self, mut req: RequestBuilder) -> RequestBuilder {
        req = req.header("accept", "application/json");
        if let Some(xsrf) = &self.xsrf_token {
            req = req.header("x-xsrf-token", xsrf);
        }
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Send a request for a JSON:API document and return its `data` member.
    pub(crate) async fn fetch_data<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        #[derive(serde::Deserialize)]
        struct Document<T> {
            data: T,
        }

        let response = req.send().await.context("HTTP request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API request failed ({status}): {body}");
        }

        let body = response.text().await.context("Failed to read response")?;
        let document: Document<T> =
            serde_json::from_str(&body).context("Failed to parse JSON response")?;
        Ok(document.data)
    }
}

/// Pick one cookie out of a `Cookie` header value.
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value() {
        let header = "session=abc; __Host-xsrf=tok=en; other=1";
        assert_eq!(cookie_value(header, XSRF_COOKIE), Some("tok=en".to_string()));
        assert_eq!(cookie_value(header, "session"), Some("abc".to_string()));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("", XSRF_COOKIE), None);
    }

    #[test]
    fn test_urls_drop_trailing_slash() -> Result<()> {
        let client = DkbClient::new(&ApiConfig {
            banking_url: "https://banking.example/".to_string(),
            api_url: "https://banking.example/api/".to_string(),
        })?;
        let req = client.get("/token").build()?;
        assert_eq!(req.url().as_str(), "https://banking.example/api/token");
        Ok(())
    }
}
