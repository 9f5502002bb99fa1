//! The single JSON document `dkb-fetch` prints on stdout.
//!
//! Account and transaction records are passed through as the API returns
//! them; only the owning account id is attached to each transaction.

use anyhow::Result;
use chrono::{Days, NaiveDate};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::dkb::DkbClient;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FetchReport {
    Success {
        success: bool,
        accounts: Vec<Value>,
        transactions: Vec<Value>,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl FetchReport {
    pub fn success(accounts: Vec<Value>, transactions: Vec<Value>) -> Self {
        Self::Success {
            success: true,
            accounts,
            transactions,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":"failed to encode result: {e}"}}"#)
        })
    }
}

/// What to collect once logged in.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub account_id: Option<String>,
    pub since: NaiveDate,
}

impl ReportRequest {
    pub fn last_days(account_id: Option<String>, today: NaiveDate, days: u32) -> Self {
        let since = today
            .checked_sub_days(Days::new(u64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        Self { account_id, since }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Account {0} not found")]
pub struct AccountNotFound(pub String);

/// Collect accounts and their recent transactions from an authenticated
/// client.
pub async fn assemble(client: &DkbClient, request: &ReportRequest) -> Result<FetchReport> {
    let accounts: Vec<Value> = client.fetch_data(client.get("/accounts/accounts")).await?;
    info!(count = accounts.len(), "accounts loaded");

    let targets: Vec<&Value> = match &request.account_id {
        Some(wanted) => {
            let matching: Vec<&Value> = accounts
                .iter()
                .filter(|a| account_id(a) == Some(wanted.as_str()))
                .collect();
            if matching.is_empty() {
                return Err(AccountNotFound(wanted.clone()).into());
            }
            matching
        }
        None => accounts.iter().collect(),
    };

    let since = request.since.format("%Y-%m-%d").to_string();
    let mut transactions = Vec::new();
    for account in targets {
        let Some(id) = account_id(account) else {
            continue;
        };

        let path = format!("/accounts/accounts/{}/transactions", urlencoding::encode(id));
        let req = client
            .get(&path)
            .query(&[("filter[bookingDate][GE]", since.as_str())]);
        match client.fetch_data::<Vec<Value>>(req).await {
            Ok(records) => {
                info!(account = id, count = records.len(), "transactions loaded");
                transactions.extend(records.into_iter().map(|mut record| {
                    if let Some(obj) = record.as_object_mut() {
                        obj.insert("accountId".to_string(), Value::String(id.to_string()));
                    }
                    record
                }));
            }
            Err(e) => warn!(account = id, "Error fetching transactions: {e:#}"),
        }
    }

    Ok(FetchReport::success(accounts, transactions))
}

fn account_id(account: &Value) -> Option<&str> {
    account.get("id").and_then(Value::as_str)
}
