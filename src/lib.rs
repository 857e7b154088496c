//! jwt-gate library
//!
//! Request-time JWT authentication for an API gateway, with a revocation
//! cross-check against a key-value store.
//!
//! # Features
//!
//! - **Token extraction**: header (with `Bearer ` stripping), query parameter, cookie
//! - **Consumer directory**: issuer key → consumer, rebuilt per configuration version
//! - **Key material**: inline secrets and PEM pairs, or vault-backed (`HS256`, `HS512`, `RS256`, `ES256`)
//! - **Revocation check**: the token must equal the subject's live token in Redis
//! - **Hot reload**: consumer list reloads from the config file without restart
//! - **Issuance**: sign tokens for configured consumers (`GET /jwt/sign`, `jwt-gate sign`)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_reload;
pub mod error;
pub mod gateway;
pub mod jwt_auth;
pub mod revocation;
pub mod vault;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
    }
}
