//! Values handed across the solver process boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Single-use proof that the challenge was solved.
///
/// `Debug` is redacted so the token never ends up in logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct RedemptionToken(String);

impl RedemptionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Consume the token, yielding the raw value for the login request.
    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RedemptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RedemptionToken(<{} chars>)", self.0.len())
    }
}

/// The one line a solver process prints on stdout.
///
/// On the wire this is `{"success":true,"token":"..."}` or
/// `{"success":false,"error":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireResult", try_from = "WireResult")]
pub enum FetchResult {
    Success { token: String },
    Failure { error: String },
}

impl FetchResult {
    pub fn success(token: RedemptionToken) -> Self {
        Self::Success {
            token: token.into_inner(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":"failed to encode result: {e}"}}"#)
        })
    }

    /// Parse a solver's stdout: the last non-empty line is the result.
    pub fn from_output(stdout: &str) -> Result<Self, String> {
        let line = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| "solver printed no result".to_string())?;
        serde_json::from_str(line).map_err(|e| format!("unparseable solver result {line:?}: {e}"))
    }
}

#[derive(Serialize, Deserialize)]
struct WireResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<FetchResult> for WireResult {
    fn from(result: FetchResult) -> Self {
        match result {
            FetchResult::Success { token } => Self {
                success: true,
                token: Some(token),
                error: None,
            },
            FetchResult::Failure { error } => Self {
                success: false,
                token: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireResult> for FetchResult {
    type Error = String;

    fn try_from(wire: WireResult) -> Result<Self, Self::Error> {
        match (wire.success, wire.token, wire.error) {
            (true, Some(token), _) if !token.is_empty() => Ok(Self::Success { token }),
            (true, _, _) => Err("success result without a token".to_string()),
            (false, _, Some(error)) if !error.is_empty() => Ok(Self::Failure { error }),
            (false, _, _) => Err("failure result without an error".to_string()),
        }
    }
}
