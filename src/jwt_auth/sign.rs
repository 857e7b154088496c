//! Token issuance for configured consumers.
//!
//! Issued tokens carry `iss` = the consumer's key, `exp` = now + the
//! consumer's `exp`, and `sub` defaulting to the consumer's username. Extra
//! claims from the caller are merged in but cannot override `iss` or `exp`.
//! Issuance never touches the revocation store; publishing the token as the
//! subject's live token is up to the caller.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::audit;
use super::directory::{Consumer, ConsumerSnapshot};
use super::keys::{KeyError, KeyResolver};
use super::token::{self, Claims, TokenError};

/// Issuance failures.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// No consumer has this key.
    #[error("no consumer with key '{0}'")]
    UnknownConsumer(String),

    /// Extra claims are not a JSON object.
    #[error("payload must be a JSON object: {0}")]
    InvalidPayload(String),

    /// Signing key unavailable.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The signing primitive failed.
    #[error(transparent)]
    Token(#[from] TokenError),
}

impl SignError {
    /// `true` when the key material, not the request, is at fault.
    #[must_use]
    pub fn is_service_error(&self) -> bool {
        matches!(self, Self::Key(_) | Self::Token(_))
    }
}

/// Parse caller-supplied extra claims.
pub fn parse_payload(payload: &str) -> Result<Claims, SignError> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SignError::InvalidPayload(format!("got {other}"))),
        Err(e) => Err(SignError::InvalidPayload(e.to_string())),
    }
}

/// Build the claim set for `consumer` at `now` (unix seconds).
#[must_use]
pub fn build_claims(consumer: &Consumer, extra: Claims, now: u64) -> Claims {
    let mut claims = extra;
    claims.insert("iss".to_string(), Value::from(consumer.auth.key.clone()));
    claims.insert(
        "exp".to_string(),
        Value::from(now.saturating_add(consumer.auth.exp)),
    );
    claims
        .entry("sub")
        .or_insert_with(|| Value::from(consumer.username.clone()));
    claims
}

/// Sign a token for `consumer` with its configured algorithm.
pub async fn sign_token(
    keys: &KeyResolver,
    consumer: &Consumer,
    extra: Claims,
) -> Result<String, SignError> {
    let key = keys.signing_key(consumer).await?;
    let claims = build_claims(consumer, extra, unix_now());
    let token = token::sign(&key, consumer.auth.algorithm, &claims)?;

    audit::record_issued(
        &consumer.username,
        claims.get("sub").and_then(Value::as_str),
    );
    Ok(token)
}

/// Look up the consumer owning `key` in `snapshot` and sign for it.
pub async fn sign_for_key(
    keys: &KeyResolver,
    snapshot: &ConsumerSnapshot,
    key: &str,
    extra: Claims,
) -> Result<String, SignError> {
    // last definition wins, as in the directory
    let consumer = snapshot
        .consumers
        .iter()
        .rev()
        .find(|c| c.auth.key == key)
        .ok_or_else(|| SignError::UnknownConsumer(key.to_string()))?;

    sign_token(keys, consumer, extra).await
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
