//! Vault access for consumer key material
//!
//! Consumers configured with `vault: true` keep their secret or key pair at
//! `consumer/<username>/jwt-auth` under the configured KV mount. Responses are
//! never cached: every resolution re-reads vault so rotated material takes
//! effect on the next request.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::VaultConfig;

/// Vault path holding the key material of `identity`.
#[must_use]
pub fn consumer_secret_path(identity: &str) -> String {
    format!("consumer/{identity}/jwt-auth")
}

/// Errors talking to vault.
///
/// "The path holds no secret" is not an error; [`SecretVault::get`] returns
/// `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Transport failure (connect, timeout, TLS, body decode).
    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Vault answered with a non-success status.
    #[error("vault returned status {status} for '{path}'")]
    Status {
        /// HTTP status code
        status: u16,
        /// Requested path
        path: String,
    },

    /// The vault client could not be constructed.
    #[error("vault client misconfigured: {0}")]
    Client(String),
}

/// A KV secret as returned by vault: `{ "data": { ... } }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultSecret {
    /// Secret fields
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl VaultSecret {
    /// Build a secret from string fields.
    #[must_use]
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            data: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        }
    }

    /// First non-empty string field among `names`.
    #[must_use]
    pub fn field(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.data.get(*name).and_then(Value::as_str))
            .find(|v| !v.is_empty())
    }
}

/// Get-by-path access to a secrets vault.
#[async_trait::async_trait]
pub trait SecretVault: Send + Sync + 'static {
    /// Read the secret stored at `path`.
    ///
    /// Returns `Ok(None)` when nothing is stored there.
    async fn get(&self, path: &str) -> Result<Option<VaultSecret>, VaultError>;
}

/// Vault KV (v1) client over HTTP.
pub struct HttpVault {
    http: reqwest::Client,
    address: String,
    prefix: String,
    token: String,
}

impl HttpVault {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Client`] if the HTTP client cannot be built.
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| VaultError::Client(e.to_string()))?;

        Ok(Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            prefix: config.prefix.trim_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            format!("{}/v1/{path}", self.address)
        } else {
            format!("{}/v1/{}/{path}", self.address, self.prefix)
        }
    }
}

#[async_trait::async_trait]
impl SecretVault for HttpVault {
    async fn get(&self, path: &str) -> Result<Option<VaultSecret>, VaultError> {
        let url = self.url_for(path);
        debug!(path = %path, "Fetching secret from vault");

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(VaultError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        let secret: VaultSecret = response.json().await?;
        Ok(Some(secret))
    }
}

/// In-process vault keyed by path. Useful for embedding and tests.
#[derive(Default)]
pub struct InMemoryVault {
    entries: DashMap<String, VaultSecret>,
}

impl InMemoryVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `secret` at `path`, replacing any previous value.
    pub fn put(&self, path: impl Into<String>, secret: VaultSecret) {
        self.entries.insert(path.into(), secret);
    }
}

#[async_trait::async_trait]
impl SecretVault for InMemoryVault {
    async fn get(&self, path: &str) -> Result<Option<VaultSecret>, VaultError> {
        Ok(self.entries.get(path).map(|e| e.value().clone()))
    }
}
