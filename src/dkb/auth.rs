//! First login factor and the hand-off to push approval.

use std::fmt;

use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use super::client::DkbClient;
use super::mfa::MfaChallenge;
use crate::captcha::RedemptionToken;
use crate::credentials::Credentials;

const MFA_METHOD_TYPE: &str = "seal_one";

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad credentials or a rejected captcha token. Retrying needs a new token.
    #[error("Login failed: 1st factor authentication failed. RC: {0}")]
    AuthenticationFailed(u16),

    #[error("Login failed: token upgrade after approval failed. RC: {0}")]
    TokenUpgradeFailed(u16),

    #[error("Login response has no mfa_id; second factor cannot be started")]
    MissingMfaId,

    #[error("MFA device {requested} not available ({available} registered)")]
    NoSuchDevice { requested: usize, available: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Token endpoint response. Only the fields the flow needs are typed.
#[derive(Clone, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    #[serde(default)]
    pub mfa_id: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPayload")
            .field("access_token", &"<redacted>")
            .field("mfa_id", &self.mfa_id)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Everything the orchestrator needs besides the HTTP session.
#[derive(Debug)]
pub struct LoginOptions {
    pub captcha_token: RedemptionToken,
    /// 1-based index of the approval device.
    pub mfa_device: usize,
}

/// First factor accepted; waiting on the push approval.
#[derive(Debug)]
pub struct PendingLogin {
    pub token: TokenPayload,
    pub challenge: MfaChallenge,
}

#[derive(Deserialize)]
struct MfaMethod {
    id: String,
    #[serde(default)]
    attributes: MfaMethodAttributes,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MfaMethodAttributes {
    #[serde(default)]
    device_name: Option<String>,
}

#[derive(Deserialize)]
struct CreatedChallenge {
    id: String,
}

pub struct AuthenticationOrchestrator {
    options: LoginOptions,
}

impl AuthenticationOrchestrator {
    pub fn new(options: LoginOptions) -> Self {
        Self { options }
    }

    /// Submit the first factor, then start a push challenge on the chosen
    /// device. Consumes the orchestrator: the captcha token is single use.
    pub async fn login(
        self,
        client: &mut DkbClient,
        credentials: &Credentials,
    ) -> Result<PendingLogin, AuthError> {
        let LoginOptions {
            captcha_token,
            mfa_device,
        } = self.options;

        let form = [
            ("captcha_token", captcha_token.into_inner()),
            ("grant_type", "banking_user_sca".to_string()),
            ("username", credentials.username.clone()),
            ("password", credentials.password.expose_secret().to_string()),
            ("sca_type", "web-login".to_string()),
        ];
        let token = submit_token_form(client, &form)
            .await?
            .map_err(AuthError::AuthenticationFailed)?;
        info!("1st factor accepted");

        let mfa_id = token.mfa_id.clone().ok_or(AuthError::MissingMfaId)?;
        let challenge = start_push_challenge(client, &mfa_id, mfa_device).await?;

        Ok(PendingLogin { token, challenge })
    }

    /// Swap the first-factor token for a full session once the push was
    /// approved, and authenticate the client with it.
    pub async fn complete(
        client: &mut DkbClient,
        pending: &PendingLogin,
    ) -> Result<TokenPayload, AuthError> {
        let mfa_id = pending.token.mfa_id.clone().ok_or(AuthError::MissingMfaId)?;
        let form = [
            ("grant_type", "banking_user_mfa".to_string()),
            ("mfa_id", mfa_id),
            ("access_token", pending.token.access_token.clone()),
        ];
        let token = submit_token_form(client, &form)
            .await?
            .map_err(AuthError::TokenUpgradeFailed)?;

        client.set_bearer(token.access_token.clone());
        info!("login complete");
        Ok(token)
    }
}

/// POST to the token endpoint. The inner `Err` carries a non-success status.
async fn submit_token_form(
    client: &DkbClient,
    form: &[(&str, String)],
) -> anyhow::Result<Result<TokenPayload, u16>> {
    use anyhow::Context;

    let response = client
        .post("/token")
        .form(form)
        .send()
        .await
        .context("Token request failed")?;

    let status = response.status();
    if !status.is_success() {
        debug!(%status, "token endpoint refused");
        return Ok(Err(status.as_u16()));
    }

    let payload = response
        .json::<TokenPayload>()
        .await
        .context("Failed to parse token response")?;
    Ok(Ok(payload))
}

async fn start_push_challenge(
    client: &DkbClient,
    mfa_id: &str,
    device: usize,
) -> Result<MfaChallenge, AuthError> {
    let methods: Vec<MfaMethod> = client
        .fetch_data(
            client
                .get("/mfa/mfa/methods")
                .query(&[("filter[methodType]", MFA_METHOD_TYPE)]),
        )
        .await?;

    let method = device
        .checked_sub(1)
        .and_then(|i| methods.get(i))
        .ok_or(AuthError::NoSuchDevice {
            requested: device,
            available: methods.len(),
        })?;
    debug!(method_id = %method.id, "selected MFA device");

    let body = json!({
        "data": {
            "type": "mfa-challenge",
            "attributes": {
                "mfaId": mfa_id,
                "methodId": method.id,
                "methodType": MFA_METHOD_TYPE,
            }
        }
    });
    let created: CreatedChallenge = client
        .fetch_data(
            client
                .post("/mfa/mfa/challenges")
                .header("content-type", "application/vnd.api+json")
                .body(body.to_string()),
        )
        .await?;

    Ok(MfaChallenge::new(
        created.id,
        method.attributes.device_name.clone(),
    ))
}
