//! Login credentials and where they come from.
//!
//! Credentials are given on the command line, through the environment, or
//! read from a password-store entry:
//!
//! ```text
//! my-dkb-password
//! username: jdoe123
//! ```

mod pass;

pub use pass::{PassConfig, PassCredentialStore};

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// A read-only key-value store for credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Retrieve a credential by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<SecretString>>;
}

/// Username and password for the first login factor.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Read `username` and `password` from a credential store.
    pub async fn from_store(store: &dyn CredentialStore) -> Result<Self> {
        let username = store
            .get("username")
            .await?
            .context("Credential store has no username")?;
        let password = store
            .get("password")
            .await?
            .context("Credential store has no password")?;

        Ok(Self {
            username: username.expose_secret().to_string(),
            password,
        })
    }
}
