//! Configuration management
//!
//! The gateway reads one YAML document (optional) merged with `JWT_GATE_`
//! prefixed environment variables. Consumer entries carry their own
//! [`AuthConfig`]; every entry is validated with [`AuthConfig::validate`]
//! before it can reach the request path.

use std::{collections::HashSet, env, path::Path, time::Duration};

use base64::Engine;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Plugin-level JWT authentication settings
    pub jwt_auth: PluginConfig,
    /// Vault service used by consumers with `vault: true`
    pub vault: Option<VaultConfig>,
    /// Consumers allowed to present tokens
    pub consumers: Vec<ConsumerConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or a consumer fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (JWT_GATE_ prefix)
        figment = figment.merge(Env::prefixed("JWT_GATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Validate every consumer and the cross-consumer invariants.
    ///
    /// Consumers are validated in order; the first failure aborts with a
    /// message naming the consumer.
    pub fn validate(&mut self) -> Result<()> {
        let vault_configured = self.vault.is_some();
        let mut seen = HashSet::new();

        for consumer in &mut self.consumers {
            if consumer.username.is_empty() {
                return Err(Error::Config("consumer username must not be empty".to_string()));
            }
            consumer
                .jwt_auth
                .validate()
                .map_err(|e| Error::Config(format!("consumer '{}': {e}", consumer.username)))?;

            if consumer.jwt_auth.vault && !vault_configured {
                return Err(Error::Config(format!(
                    "consumer '{}': vault is enabled but no top-level `vault` section is configured",
                    consumer.username
                )));
            }

            if !seen.insert(consumer.jwt_auth.key.clone()) {
                // Last definition wins when the directory is built.
                tracing::warn!(
                    key = %consumer.jwt_auth.key,
                    consumer = %consumer.username,
                    "Duplicate jwt_auth key, later consumer overrides earlier one"
                );
            }
        }

        Ok(())
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing values
    fn expand_env_vars(&mut self) {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        if let Some(vault) = &mut self.vault {
            vault.token = Self::expand_string(&re, &vault.token);
        }

        for consumer in &mut self.consumers {
            let auth = &mut consumer.jwt_auth;
            if let Some(secret) = &mut auth.secret {
                *secret = Self::expand_string(&re, secret);
            }
            if let Some(password) = &mut auth.store.password {
                *password = Self::expand_string(&re, password);
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Expose `GET /jwt/sign` for token issuance
    pub sign_endpoint: bool,
    /// Reload consumers when the config file changes
    pub watch_config: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9080,
            request_timeout: Duration::from_secs(30),
            sign_endpoint: false,
            watch_config: true,
        }
    }
}

/// Plugin-level settings: where to look for the token and which paths bypass
/// authentication entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Request header carrying the token
    pub header: String,
    /// Query parameter carrying the token
    pub query: String,
    /// Cookie carrying the token
    pub cookie: String,
    /// Paths that skip authentication (exact match)
    pub skip_paths: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            header: "authorization".to_string(),
            query: "jwt".to_string(),
            cookie: "jwt".to_string(),
            skip_paths: vec!["/health".to_string()],
        }
    }
}

/// Vault KV service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault address, e.g. `http://127.0.0.1:8200`
    pub address: String,
    /// KV mount prefix the consumer paths live under
    pub prefix: String,
    /// Vault token (supports `${VAR}`)
    pub token: String,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            prefix: "kv/jwt-gate".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// A configured caller identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer identity name
    pub username: String,
    /// Authentication settings for this consumer
    pub jwt_auth: AuthConfig,
}

/// Signing algorithm configured for a consumer.
///
/// The consumer's configured algorithm is the only one ever used for
/// verification; the token header's `alg` is never trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[allow(clippy::upper_case_acronyms)]
pub enum Algorithm {
    /// HMAC SHA-256
    #[default]
    HS256,
    /// HMAC SHA-512
    HS512,
    /// RSA PKCS#1 v1.5 SHA-256
    RS256,
    /// ECDSA P-256 SHA-256
    ES256,
}

/// Which kind of key material an algorithm needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// Shared secret (HS*)
    Symmetric,
    /// Public/private key pair (RS*, ES*)
    Asymmetric,
}

impl Algorithm {
    /// The key family for this algorithm. Both configuration validation and
    /// request-time key resolution dispatch on this.
    #[must_use]
    pub fn family(self) -> KeyFamily {
        match self {
            Self::HS256 | Self::HS512 => KeyFamily::Symmetric,
            Self::RS256 | Self::ES256 => KeyFamily::Asymmetric,
        }
    }

    /// The matching `jsonwebtoken` algorithm.
    #[must_use]
    pub fn to_jwt(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::HS256 => jsonwebtoken::Algorithm::HS256,
            Self::HS512 => jsonwebtoken::Algorithm::HS512,
            Self::RS256 => jsonwebtoken::Algorithm::RS256,
            Self::ES256 => jsonwebtoken::Algorithm::ES256,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HS256 => "HS256",
            Self::HS512 => "HS512",
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
        };
        f.write_str(s)
    }
}

/// How a consumer supplies its key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySupply {
    /// Inline fields only; all required material must be present.
    Inline,
    /// Everything comes from vault.
    Vault,
    /// Inline fields first, vault fills the gaps.
    InlineWithVaultFallback,
}

/// Per-consumer JWT authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Issuer identity (`iss` claim) that selects this consumer
    pub key: String,
    /// Shared secret for HS* algorithms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Signing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
    /// PEM public key for RS*/ES*
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// PEM private key for RS*/ES* (only needed for signing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Fetch key material from vault
    #[serde(default)]
    pub vault: bool,
    /// Lifetime of issued tokens in seconds
    #[serde(default = "default_exp")]
    pub exp: u64,
    /// Treat `secret` as base64
    #[serde(default)]
    pub base64_secret: bool,
    /// Clock leeway applied to `exp`/`nbf` checks, in seconds
    #[serde(default)]
    pub lifetime_grace_period: u64,
    /// Revocation store holding the live token per subject
    #[serde(default)]
    pub store: RevocationStoreConfig,
    /// Set when `secret` was generated by [`AuthConfig::validate`] rather
    /// than configured
    #[serde(skip)]
    pub secret_generated: bool,
}

fn default_exp() -> u64 {
    86_400
}

impl AuthConfig {
    /// Create a config for `key` with every other field at its default.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: None,
            algorithm: Algorithm::default(),
            public_key: None,
            private_key: None,
            vault: false,
            exp: default_exp(),
            base64_secret: false,
            lifetime_grace_period: 0,
            store: RevocationStoreConfig::default(),
            secret_generated: false,
        }
    }

    /// Classify how this consumer supplies its key material.
    #[must_use]
    pub fn key_supply(&self) -> KeySupply {
        let has_inline =
            self.secret.is_some() || self.public_key.is_some() || self.private_key.is_some();
        match (self.vault, has_inline) {
            (false, _) => KeySupply::Inline,
            (true, false) => KeySupply::Vault,
            (true, true) => KeySupply::InlineWithVaultFallback,
        }
    }

    /// Validate shape and key material. May fill in a generated secret.
    ///
    /// Vault-backed consumers skip the key presence checks.
    pub fn validate(&mut self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config("jwt_auth.key is required".to_string()));
        }
        if self.exp < 1 {
            return Err(Error::Config("jwt_auth.exp must be at least 1 second".to_string()));
        }
        self.store.validate()?;

        if self.key_supply() != KeySupply::Inline {
            return Ok(());
        }

        match self.algorithm.family() {
            KeyFamily::Symmetric => {
                if self.secret.is_none() {
                    self.secret = Some(generate_secret());
                    self.secret_generated = true;
                }
                if self.base64_secret
                    && self.secret.as_deref().is_some_and(|secret| {
                        base64::engine::general_purpose::STANDARD
                            .decode(secret.as_bytes())
                            .is_err()
                    })
                {
                    return Err(Error::Config(
                        "base64_secret required but the secret is not valid base64".to_string(),
                    ));
                }
            }
            KeyFamily::Asymmetric => {
                if self.public_key.is_none() {
                    return Err(Error::Config(format!(
                        "missing valid public key for {}",
                        self.algorithm
                    )));
                }
                if self.private_key.is_none() {
                    return Err(Error::Config(format!(
                        "missing valid private key for {}",
                        self.algorithm
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Generate a random 32-byte secret, base64 encoded.
fn generate_secret() -> String {
    let random_bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(random_bytes)
}

/// Connection parameters for the revocation store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RevocationStoreConfig {
    /// Store host
    pub host: String,
    /// Store port
    pub port: u16,
    /// Password sent with `AUTH` on fresh connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Logical database selected on fresh connections
    pub database: u32,
    /// Timeout applied to connect, send and receive
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Prefix prepended to the subject to form the lookup key
    pub token_prefix: String,
}

impl Default for RevocationStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            timeout: Duration::from_millis(1000),
            token_prefix: String::new(),
        }
    }
}

impl RevocationStoreConfig {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("jwt_auth.store.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("jwt_auth.store.port must be non-zero".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config(
                "jwt_auth.store.timeout must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a millisecond string (e.g., "1500ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };

        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            let mins = mins
                .parse::<u64>()
                .map_err(<D::Error as serde::de::Error>::custom)?;
            mins.checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| serde::de::Error::custom(format!("duration too large: {s}")))
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
