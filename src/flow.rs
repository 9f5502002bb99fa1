//! The whole unattended fetch: captcha, first factor, push approval,
//! token upgrade, then the account report.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::captcha::{AttemptError, AttemptRunner, RetryPolicy};
use crate::config::Config;
use crate::credentials::Credentials;
use crate::dkb::{
    ApprovalConfirmationPoller, AuthError, AuthenticationOrchestrator, ChallengeStatus, DkbClient,
    LoginOptions, NoticeSink, PollerConfig,
};
use crate::report::{self, AccountNotFound, FetchReport, ReportRequest};

pub struct FetchRequest {
    pub credentials: Credentials,
    /// Restrict the report to one account.
    pub account_id: Option<String>,
    /// Transaction history window, counted back from today.
    pub days: u32,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to get captcha token: {0}")]
    Captcha(#[from] AttemptError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Login rejected in banking app")]
    ApprovalRejected,

    #[error("MFA timeout - no approval received after {0}s")]
    ApprovalTimeout(u64),

    #[error(transparent)]
    AccountNotFound(#[from] AccountNotFound),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run one fetch end to end. Every failure ends the run; a new captcha is
/// needed for another login anyway.
pub async fn run(
    config: &Config,
    runner: &dyn AttemptRunner,
    request: FetchRequest,
    notices: Arc<dyn NoticeSink>,
) -> Result<FetchReport, FetchError> {
    let captcha_token = RetryPolicy::from_config(&config.isolation)
        .run(runner)
        .await?;

    let mut client = DkbClient::new(&config.api)?;
    client.bootstrap().await?;

    let orchestrator = AuthenticationOrchestrator::new(LoginOptions {
        captcha_token,
        mfa_device: config.mfa.device,
    });
    let mut pending = orchestrator.login(&mut client, &request.credentials).await?;

    let poller_config = PollerConfig::from(&config.mfa);
    let budget = poller_config.interval * poller_config.max_iterations;
    let poller = ApprovalConfirmationPoller::new(poller_config, notices);
    match poller.confirm(&client, &mut pending.challenge).await {
        ChallengeStatus::Approved => {}
        ChallengeStatus::Rejected => return Err(FetchError::ApprovalRejected),
        _ => return Err(FetchError::ApprovalTimeout(budget.as_secs())),
    }

    AuthenticationOrchestrator::complete(&mut client, &pending).await?;

    let report_request =
        ReportRequest::last_days(request.account_id, Utc::now().date_naive(), request.days);
    let report = report::assemble(&client, &report_request)
        .await
        .map_err(|e| match e.downcast::<AccountNotFound>() {
            Ok(not_found) => FetchError::AccountNotFound(not_found),
            Err(other) => FetchError::Other(other),
        })?;

    info!("fetch complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            FetchError::ApprovalTimeout(120).to_string(),
            "MFA timeout - no approval received after 120s"
        );
        assert_eq!(
            FetchError::from(AccountNotFound("x".to_string())).to_string(),
            "Account x not found"
        );
        assert_eq!(
            FetchError::from(AttemptError::NoAttempts).to_string(),
            "Failed to get captcha token: no captcha attempts allowed (max_retries = 0)"
        );
    }
}
