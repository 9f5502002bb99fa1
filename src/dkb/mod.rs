//! DKB banking API: login, push-approval and the raw data endpoints.

pub mod auth;
mod client;
pub mod mfa;

pub use auth::{AuthError, AuthenticationOrchestrator, LoginOptions, PendingLogin, TokenPayload};
pub use client::DkbClient;
pub use mfa::{
    ApprovalConfirmationPoller, ChallengeStatus, ChallengeStatusSource, MfaChallenge, NoticeSink,
    PollError, PollerConfig, StderrNotices,
};
