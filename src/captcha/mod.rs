//! Friendly Captcha solving.
//!
//! A real browser loads the login page and the widget solves itself; we only
//! nudge the UI and watch the provider's network responses for the redemption
//! token. Each solve runs in its own process (see [`isolation`]) so a hung
//! browser cannot take the caller down with it.

pub mod acquirer;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod isolation;
mod protocol;
pub mod tap;

pub use acquirer::{AcquireError, ChallengePage, ChallengeTokenAcquirer};
pub use isolation::{
    Attempt, AttemptError, AttemptOutcome, AttemptRunner, IsolatedRunner, RetryPolicy,
};
pub use protocol::{FetchResult, RedemptionToken};
pub use tap::{NetworkEvent, NetworkEventTap, UrlPredicates};
