//! Key material resolution
//!
//! The consumer's configured [`Algorithm`] decides which path runs: HS*
//! consumers resolve a shared secret, RS*/ES* consumers resolve a PEM key
//! pair. Material comes from inline configuration or from vault at
//! [`consumer_secret_path`]. Vault is read on every call; nothing is cached.

use std::sync::Arc;

use base64::Engine;
use jsonwebtoken::{DecodingKey, EncodingKey};
use tracing::debug;

use crate::config::{Algorithm, AuthConfig, KeyFamily};
use crate::jwt_auth::directory::Consumer;
use crate::vault::{SecretVault, VaultError, VaultSecret, consumer_secret_path};

const SECRET_FIELDS: &[&str] = &["secret"];
const PUBLIC_KEY_FIELDS: &[&str] = &["public_key", "publicKey"];
const PRIVATE_KEY_FIELDS: &[&str] = &["private_key", "privateKey"];

/// Key material resolution failures. All of them are operator-side problems.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// A consumer wants vault but no vault service is configured.
    #[error("vault is enabled for '{0}' but no vault service is configured")]
    VaultNotConfigured(String),

    /// The vault call itself failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Vault holds no `secret` for the consumer.
    #[error("vault holds no secret at '{0}'")]
    VaultSecretMissing(String),

    /// Neither inline configuration nor vault supplied a secret.
    #[error("no secret configured for '{0}'")]
    MissingSecret(String),

    /// `base64_secret` is set but the secret does not decode.
    #[error("secret for '{0}' is not valid base64")]
    InvalidEncoding(String),

    /// No public key available for an asymmetric algorithm.
    #[error("missing public key for '{0}'")]
    MissingPublicKey(String),

    /// No private key available for an asymmetric algorithm.
    #[error("missing private key for '{0}'")]
    MissingPrivateKey(String),

    /// The material could not be turned into a key for the algorithm.
    #[error("invalid {alg} key for '{identity}': {source}")]
    InvalidKey {
        /// Consumer identity
        identity: String,
        /// Configured algorithm
        alg: Algorithm,
        /// Underlying parse error
        source: jsonwebtoken::errors::Error,
    },
}

/// What the key pair is needed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    /// Verifying a presented token; only the public half is required.
    Verify,
    /// Issuing a token; both halves are required.
    Sign,
}

/// PEM key pair. The private half is only guaranteed for [`KeyUse::Sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// PEM public key
    pub public_key: String,
    /// PEM private key
    pub private_key: Option<String>,
}

/// Resolves key material for consumers.
#[derive(Clone, Default)]
pub struct KeyResolver {
    vault: Option<Arc<dyn SecretVault>>,
}

impl KeyResolver {
    /// Create a resolver. `vault` is required only by consumers with
    /// `vault: true`.
    #[must_use]
    pub fn new(vault: Option<Arc<dyn SecretVault>>) -> Self {
        Self { vault }
    }

    /// Shared secret bytes for an HS* consumer.
    ///
    /// With vault enabled the secret comes from vault exclusively.
    pub async fn symmetric_secret(
        &self,
        auth: &AuthConfig,
        identity: &str,
    ) -> Result<Vec<u8>, KeyError> {
        let secret = if auth.vault {
            let path = consumer_secret_path(identity);
            self.fetch(identity, &path)
                .await?
                .as_ref()
                .and_then(|s| s.field(SECRET_FIELDS))
                .map(str::to_string)
                .ok_or(KeyError::VaultSecretMissing(path))?
        } else {
            auth.secret
                .clone()
                .ok_or_else(|| KeyError::MissingSecret(identity.to_string()))?
        };

        if auth.base64_secret {
            base64::engine::general_purpose::STANDARD
                .decode(secret.as_bytes())
                .map_err(|_| KeyError::InvalidEncoding(identity.to_string()))
        } else {
            Ok(secret.into_bytes())
        }
    }

    /// PEM key pair for an RS*/ES* consumer.
    ///
    /// Inline keys win. Vault is consulted only when it is enabled and the
    /// inline keys do not already cover `purpose`; it fills whichever half is
    /// missing.
    pub async fn key_pair(
        &self,
        auth: &AuthConfig,
        identity: &str,
        purpose: KeyUse,
    ) -> Result<KeyPair, KeyError> {
        let mut public_key = auth.public_key.clone();
        let mut private_key = auth.private_key.clone();

        let covered = public_key.is_some() && (purpose == KeyUse::Verify || private_key.is_some());
        if !covered && auth.vault {
            let path = consumer_secret_path(identity);
            if let Some(secret) = self.fetch(identity, &path).await? {
                if public_key.is_none() {
                    public_key = secret.field(PUBLIC_KEY_FIELDS).map(str::to_string);
                }
                if private_key.is_none() {
                    private_key = secret.field(PRIVATE_KEY_FIELDS).map(str::to_string);
                }
            }
        }

        let public_key = public_key.ok_or_else(|| KeyError::MissingPublicKey(identity.to_string()))?;
        if purpose == KeyUse::Sign && private_key.is_none() {
            return Err(KeyError::MissingPrivateKey(identity.to_string()));
        }

        Ok(KeyPair {
            public_key,
            private_key,
        })
    }

    /// Key that verifies tokens for `consumer` under its configured algorithm.
    pub async fn verification_key(&self, consumer: &Consumer) -> Result<DecodingKey, KeyError> {
        let auth = &consumer.auth;
        let alg = auth.algorithm;
        let invalid = |source| KeyError::InvalidKey {
            identity: consumer.username.clone(),
            alg,
            source,
        };

        match alg.family() {
            KeyFamily::Symmetric => {
                let secret = self.symmetric_secret(auth, &consumer.username).await?;
                Ok(DecodingKey::from_secret(&secret))
            }
            KeyFamily::Asymmetric => {
                let pair = self
                    .key_pair(auth, &consumer.username, KeyUse::Verify)
                    .await?;
                let pem = pair.public_key.as_bytes();
                match alg {
                    Algorithm::ES256 => DecodingKey::from_ec_pem(pem),
                    _ => DecodingKey::from_rsa_pem(pem),
                }
                .map_err(invalid)
            }
        }
    }

    /// Key that signs tokens for `consumer` under its configured algorithm.
    pub async fn signing_key(&self, consumer: &Consumer) -> Result<EncodingKey, KeyError> {
        let auth = &consumer.auth;
        let alg = auth.algorithm;
        let invalid = |source| KeyError::InvalidKey {
            identity: consumer.username.clone(),
            alg,
            source,
        };

        match alg.family() {
            KeyFamily::Symmetric => {
                let secret = self.symmetric_secret(auth, &consumer.username).await?;
                Ok(EncodingKey::from_secret(&secret))
            }
            KeyFamily::Asymmetric => {
                let pair = self
                    .key_pair(auth, &consumer.username, KeyUse::Sign)
                    .await?;
                let pem = pair
                    .private_key
                    .ok_or_else(|| KeyError::MissingPrivateKey(consumer.username.clone()))?;
                match alg {
                    Algorithm::ES256 => EncodingKey::from_ec_pem(pem.as_bytes()),
                    _ => EncodingKey::from_rsa_pem(pem.as_bytes()),
                }
                .map_err(invalid)
            }
        }
    }

    async fn fetch(&self, identity: &str, path: &str) -> Result<Option<VaultSecret>, KeyError> {
        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| KeyError::VaultNotConfigured(identity.to_string()))?;
        debug!(consumer = %identity, path = %path, "Resolving key material from vault");
        Ok(vault.get(path).await?)
    }
}
