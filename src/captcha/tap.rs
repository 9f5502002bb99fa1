//! Passive capture of the captcha provider's network responses.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

/// URLs that identify the two provider responses we care about.
#[derive(Debug, Clone)]
pub struct UrlPredicates {
    activation: String,
    redemption: String,
}

impl UrlPredicates {
    pub fn new(activation: impl Into<String>, redemption: impl Into<String>) -> Self {
        Self {
            activation: activation.into(),
            redemption: redemption.into(),
        }
    }

    pub fn is_activation_url(&self, url: &str) -> bool {
        url == self.activation
    }

    pub fn is_redemption_url(&self, url: &str) -> bool {
        url == self.redemption
    }
}

/// A matching response. The body stays in the browser until asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    pub url: String,
    pub request_id: String,
}

#[derive(Default)]
struct Buffers {
    activation: Vec<NetworkEvent>,
    redemption: Vec<NetworkEvent>,
}

/// Append-only buffers of activation and redemption responses.
///
/// The browser's event task is the only writer; the acquirer only reads
/// snapshots. Clones share the same buffers.
#[derive(Clone)]
pub struct NetworkEventTap {
    predicates: Arc<UrlPredicates>,
    buffers: Arc<Mutex<Buffers>>,
}

impl NetworkEventTap {
    pub fn new(predicates: UrlPredicates) -> Self {
        Self {
            predicates: Arc::new(predicates),
            buffers: Arc::default(),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a response if its URL matches one of the predicates.
    ///
    /// Returns whether the event was kept.
    pub fn observe(&self, url: &str, request_id: impl Into<String>) -> bool {
        if self.predicates.is_redemption_url(url) {
            self.buffers().redemption.push(NetworkEvent {
                url: url.to_string(),
                request_id: request_id.into(),
            });
            info!("redeem token response logged");
            true
        } else if self.predicates.is_activation_url(url) {
            self.buffers().activation.push(NetworkEvent {
                url: url.to_string(),
                request_id: request_id.into(),
            });
            info!("captcha activated");
            true
        } else {
            false
        }
    }

    pub fn activation_count(&self) -> usize {
        self.buffers().activation.len()
    }

    pub fn redemption_count(&self) -> usize {
        self.buffers().redemption.len()
    }

    /// The most recent redemption response, if any.
    ///
    /// If the provider re-issues a token, the last one wins.
    pub fn latest_redemption(&self) -> Option<NetworkEvent> {
        let latest = self.buffers().redemption.last().cloned();
        if latest.is_some() {
            debug!(count = self.redemption_count(), "redemption responses captured");
        }
        latest
    }
}
