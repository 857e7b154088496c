//! Error types for jwt-gate

use std::io;

use thiserror::Error;

use crate::jwt_auth::sign::SignError;
use crate::vault::VaultError;

/// Result type alias for jwt-gate
pub type Result<T> = std::result::Result<T, Error>;

/// jwt-gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (schema or key-material validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Vault service error
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Token issuance failed
    #[error("Token issuance failed: {0}")]
    Sign(#[from] SignError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` when the failure is attributable to an external service or to
    /// operator-supplied key material rather than to the caller.
    #[must_use]
    pub fn is_service_error(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Sign(e) => e.is_service_error(),
            Self::Vault(_) | Self::Io(_) | Self::Internal(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt_auth::keys::KeyError;

    #[test]
    fn caller_mistakes_are_not_service_errors() {
        assert!(!Error::Config("bad".to_string()).is_service_error());
        assert!(!Error::from(SignError::UnknownConsumer("k9".to_string())).is_service_error());
        assert!(!Error::from(SignError::InvalidPayload("got 1".to_string())).is_service_error());
    }

    #[test]
    fn key_and_vault_failures_are_service_errors() {
        let missing = SignError::from(KeyError::MissingPrivateKey("alice".to_string()));
        assert!(Error::from(missing).is_service_error());
        assert!(Error::Internal("boom".to_string()).is_service_error());
    }
}
