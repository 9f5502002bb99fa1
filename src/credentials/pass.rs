//! Password-store (pass) credential backend.
//!
//! Retrieves credentials from pass entries. Each entry can contain multiple
//! fields in the format `field-name: value`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::process::Command;

use super::CredentialStore;

/// Configuration for a pass credential store.
#[derive(Debug, Clone, Deserialize)]
pub struct PassConfig {
    /// The pass entry path (e.g., "finance/dkb").
    pub path: String,

    /// Mapping from logical key names to field names in the pass entry.
    /// If not specified, the logical key name is used as-is.
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Credential store backed by password-store (pass).
///
/// The first line of the entry is exposed as the `password` field.
pub struct PassCredentialStore {
    config: PassConfig,
}

impl PassCredentialStore {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    /// Create a store for a simple pass entry path, using key names directly as field names.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self::new(PassConfig {
            path: path.into(),
            fields: HashMap::new(),
        })
    }

    fn field_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.config
            .fields
            .get(key)
            .map(|s| s.as_str())
            .unwrap_or(key)
    }

    async fn read_entry(&self) -> Result<HashMap<String, String>> {
        let output = Command::new("pass")
            .arg("show")
            .arg(&self.config.path)
            .output()
            .await
            .context("Failed to run pass command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("pass command failed: {}", stderr.trim());
        }

        let content = String::from_utf8(output.stdout).context("Invalid UTF-8 in pass output")?;
        Ok(parse_entry(&content))
    }
}

#[async_trait]
impl CredentialStore for PassCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<SecretString>> {
        let field = self.field_name(key);
        let mut entry = self.read_entry().await?;
        Ok(entry.remove(field).map(SecretString::from))
    }
}

fn parse_entry(content: &str) -> HashMap<String, String> {
    let mut lines = content.lines();
    let mut fields = HashMap::new();

    if let Some(password) = lines.next() {
        fields.insert("password".to_string(), password.to_string());
    }

    for line in lines {
        if let Some((key, value)) = line.split_once(": ") {
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }

    fields
}
