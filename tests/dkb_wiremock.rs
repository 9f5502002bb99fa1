use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, Utc};
use dkb_fetch::captcha::{Attempt, AttemptOutcome, AttemptRunner, RedemptionToken};
use dkb_fetch::config::Config;
use dkb_fetch::credentials::Credentials;
use dkb_fetch::dkb::{AuthError, NoticeSink};
use dkb_fetch::flow::{self, FetchError, FetchRequest};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedToken;

#[async_trait]
impl AttemptRunner for FixedToken {
    async fn run_attempt(&self, _attempt: &Attempt) -> AttemptOutcome {
        AttemptOutcome::Success(RedemptionToken::new("captcha-tok"))
    }
}

#[derive(Default)]
struct RecordedNotices(Mutex<Vec<String>>);

impl NoticeSink for RecordedNotices {
    fn notice(&self, message: &str) {
        self.0.lock().unwrap().push(message.to_string());
    }
}

fn quiet() -> Arc<RecordedNotices> {
    Arc::new(RecordedNotices::default())
}

fn config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.api.banking_url = server.uri();
    config.api.api_url = format!("{}/api", server.uri());
    config.isolation.max_retries = 1;
    config.mfa.interval = Duration::from_millis(1);
    config
}

fn request(account_id: Option<&str>) -> FetchRequest {
    FetchRequest {
        credentials: Credentials::new("jdoe", "s3cret"),
        account_id: account_id.map(str::to_string),
        days: 90,
    }
}

fn json_api(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

async fn mount_first_factor(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/token"))
        .and(body_string_contains("grant_type=banking_user_sca"))
        .and(body_string_contains("captcha_token=captcha-tok"))
        .and(body_string_contains("username=jdoe"))
        .and(body_string_contains("sca_type=web-login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "first-factor",
            "mfa_id": "mfa-1",
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/mfa/mfa/methods"))
        .and(query_param("filter[methodType]", "seal_one"))
        .respond_with(json_api(json!([
            { "id": "method-1", "attributes": { "deviceName": "Pixel 8" } },
            { "id": "method-2", "attributes": { "deviceName": "Old phone" } }
        ])))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/mfa/mfa/challenges"))
        .and(header("content-type", "application/vnd.api+json"))
        .and(body_string_contains("method-1"))
        .respond_with(json_api(json!({ "id": "challenge-1" })))
        .mount(server)
        .await;
}

async fn mount_challenge_status(server: &MockServer, pending_polls: u64, terminal: &str) {
    let status = |s: &str| json_api(json!({ "attributes": { "verificationStatus": s } }));

    if pending_polls > 0 {
        Mock::given(method("GET"))
            .and(path("/api/mfa/mfa/challenges/challenge-1"))
            .respond_with(status("processing"))
            .up_to_n_times(pending_polls)
            .with_priority(1)
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/api/mfa/mfa/challenges/challenge-1"))
        .respond_with(status(terminal))
        .with_priority(2)
        .mount(server)
        .await;
}

async fn mount_upgrade(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .and(body_string_contains("grant_type=banking_user_mfa"))
        .and(body_string_contains("mfa_id=mfa-1"))
        .and(body_string_contains("access_token=first-factor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "full-session",
            "token_type": "Bearer"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mount_accounts(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/accounts/accounts"))
        .and(header("authorization", "Bearer full-session"))
        .respond_with(json_api(json!([
            { "id": "acc-1", "type": "account", "attributes": { "iban": "DE00 1234" } },
            { "id": "acc-2", "type": "account", "attributes": { "iban": "DE00 5678" } }
        ])))
        .mount(server)
        .await;

    let since = Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(90))
        .unwrap()
        .format("%Y-%m-%d")
        .to_string();
    Mock::given(method("GET"))
        .and(path("/api/accounts/accounts/acc-1/transactions"))
        .and(query_param("filter[bookingDate][GE]", since.as_str()))
        .and(header("authorization", "Bearer full-session"))
        .respond_with(json_api(json!([
            { "id": "tx-1", "attributes": { "amount": { "value": "-12.50" } } }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/accounts/accounts/acc-2/transactions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_login_and_report() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;
    mount_challenge_status(&server, 3, "processed").await;
    mount_upgrade(&server, 1).await;
    mount_accounts(&server).await;

    let notices = quiet();
    let report = flow::run(&config(&server), &FixedToken, request(None), notices.clone()).await?;

    assert!(report.is_success());
    let json: Value = serde_json::from_str(&report.to_json())?;
    assert_eq!(json["success"], true);
    assert_eq!(json["accounts"].as_array().unwrap().len(), 2);
    assert_eq!(json["accounts"][0]["attributes"]["iban"], "DE00 1234");

    // acc-2 failed and is skipped; the record itself is passed through
    let transactions = json["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["id"], "tx-1");
    assert_eq!(transactions[0]["accountId"], "acc-1");
    assert_eq!(transactions[0]["attributes"]["amount"]["value"], "-12.50");

    let notices = notices.0.lock().unwrap();
    assert!(notices[0].contains("Pixel 8"));
    assert_eq!(notices.last().unwrap(), "Phone approval received!");
    Ok(())
}

#[tokio::test]
async fn single_account_filter() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;
    mount_challenge_status(&server, 0, "processed").await;
    mount_upgrade(&server, 1).await;
    mount_accounts(&server).await;

    let report = flow::run(&config(&server), &FixedToken, request(Some("acc-1")), quiet()).await?;

    let json: Value = serde_json::from_str(&report.to_json())?;
    // accounts are listed in full, transactions only for the chosen one
    assert_eq!(json["accounts"].as_array().unwrap().len(), 2);
    assert_eq!(json["transactions"].as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_account_id_fails() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;
    mount_challenge_status(&server, 0, "processed").await;
    mount_upgrade(&server, 1).await;
    mount_accounts(&server).await;

    let err = flow::run(&config(&server), &FixedToken, request(Some("acc-9")), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::AccountNotFound(_)));
    assert_eq!(err.to_string(), "Account acc-9 not found");
    Ok(())
}

#[tokio::test]
async fn rejected_first_factor_stops_before_mfa() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/mfa/mfa/methods"))
        .respond_with(json_api(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let err = flow::run(&config(&server), &FixedToken, request(None), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Auth(AuthError::AuthenticationFailed(401))));
    assert_eq!(
        err.to_string(),
        "Login failed: 1st factor authentication failed. RC: 401"
    );
    Ok(())
}

#[tokio::test]
async fn rejected_approval_skips_the_upgrade() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;
    mount_challenge_status(&server, 2, "canceled").await;
    mount_upgrade(&server, 0).await;

    let err = flow::run(&config(&server), &FixedToken, request(None), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::ApprovalRejected));
    Ok(())
}

#[tokio::test]
async fn unapproved_login_times_out() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;
    mount_challenge_status(&server, 1_000, "processed").await;
    mount_upgrade(&server, 0).await;

    let mut config = config(&server);
    config.mfa.max_iterations = 4;

    let err = flow::run(&config, &FixedToken, request(None), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::ApprovalTimeout(_)));
    Ok(())
}

#[tokio::test]
async fn missing_device_is_reported() -> Result<()> {
    let server = MockServer::start().await;
    mount_first_factor(&server).await;

    let mut config = config(&server);
    config.mfa.device = 3;

    let err = flow::run(&config, &FixedToken, request(None), quiet())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FetchError::Auth(AuthError::NoSuchDevice {
            requested: 3,
            available: 2
        })
    ));
    Ok(())
}

#[tokio::test]
async fn captcha_failure_means_no_login_attempt() -> Result<()> {
    struct Broken;

    #[async_trait]
    impl AttemptRunner for Broken {
        async fn run_attempt(&self, _attempt: &Attempt) -> AttemptOutcome {
            AttemptOutcome::Failure("browser crashed".to_string())
        }
    }

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.isolation.cooldown = Duration::ZERO;
    config.isolation.max_retries = 2;

    let err = flow::run(&config, &Broken, request(None), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Captcha(_)));
    assert!(err.to_string().contains("browser crashed"));
    Ok(())
}
