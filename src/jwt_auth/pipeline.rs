//! The per-request authentication decision.
//!
//! Steps run in a fixed order and the first failing step decides the
//! outcome:
//!
//! 1. skip list (exact path match) → allow without looking at a token
//! 2. extract the token (header, query, cookie)
//! 3. structural decode
//! 4. `iss` → consumer via the directory, at the current configuration version
//! 5. key material for the consumer's configured algorithm
//! 6. signature and time claims
//! 7. `sub` → live token in the revocation store, compared to the presented one
//!
//! Each failure maps to one [`DenyReason`]. There is no path from an error to
//! an allow.

use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::PluginConfig;
use crate::config_reload::LiveConsumers;
use crate::jwt_auth::audit;
use crate::jwt_auth::directory::{ConsumerDirectory, DirectoryError};
use crate::jwt_auth::extract::{AuthRequest, extract_token};
use crate::jwt_auth::keys::KeyResolver;
use crate::jwt_auth::token::{self, Claims, JwtObject};
use crate::revocation::RevocationStore;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// No token in header, query or cookie
    TokenMissing,
    /// Token is not a structurally valid JWT
    TokenInvalid,
    /// Token has no `iss` claim
    MissingIssuer,
    /// No consumers are configured at all
    MissingConsumer,
    /// No consumer uses the token's `iss`
    UnknownIssuer,
    /// Key material could not be resolved
    KeyUnavailable,
    /// Signature or time claims rejected
    VerificationFailed,
    /// Verified token has no `sub` claim
    MissingSubject,
    /// Revocation store could not be queried
    StoreUnavailable,
    /// The store has no live token for the subject
    TokenRevokedOrUnknown,
    /// The store's live token is a different one
    TokenSuperseded,
}

impl DenyReason {
    /// Stable machine-readable code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::TokenMissing => "token_missing",
            Self::TokenInvalid => "token_invalid",
            Self::MissingIssuer => "missing_issuer",
            Self::MissingConsumer => "missing_consumer",
            Self::UnknownIssuer => "unknown_issuer",
            Self::KeyUnavailable => "key_unavailable",
            Self::VerificationFailed => "verification_failed",
            Self::MissingSubject => "missing_subject",
            Self::StoreUnavailable => "store_unavailable",
            Self::TokenRevokedOrUnknown => "token_revoked_or_unknown",
            Self::TokenSuperseded => "token_superseded",
        }
    }

    /// `true` for failures caused by a dependency or operator configuration
    /// rather than by the caller.
    #[must_use]
    pub fn is_service_error(self) -> bool {
        matches!(self, Self::KeyUnavailable | Self::StoreUnavailable)
    }

    /// HTTP status for the denial.
    #[must_use]
    pub fn status(self) -> StatusCode {
        if self.is_service_error() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::UNAUTHORIZED
        }
    }

    /// Human-readable message returned to the caller.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::TokenMissing => "Missing JWT token in request",
            Self::TokenInvalid => "JWT token invalid",
            Self::MissingIssuer => "missing user key in JWT token",
            Self::MissingConsumer => "Missing related consumer",
            Self::UnknownIssuer => "Invalid user key in JWT token",
            Self::KeyUnavailable => "failed to resolve key material",
            Self::VerificationFailed => "failed to verify jwt",
            Self::MissingSubject => "missing subject in JWT token",
            Self::StoreUnavailable => "revocation store unavailable",
            Self::TokenRevokedOrUnknown => "token is revoked or unknown",
            Self::TokenSuperseded => "token has been superseded",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A deny decision with its diagnostic detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct Denial {
    /// Reason
    pub reason: DenyReason,
    /// Diagnostic detail (parser/verifier/store message). Empty when the
    /// reason says it all.
    pub detail: String,
}

impl Denial {
    /// Denial without detail.
    #[must_use]
    pub fn new(reason: DenyReason) -> Self {
        Self {
            reason,
            detail: String::new(),
        }
    }

    /// Denial carrying the underlying error's message.
    #[must_use]
    pub fn with_detail(reason: DenyReason, detail: impl fmt::Display) -> Self {
        Self {
            reason,
            detail: detail.to_string(),
        }
    }
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedConsumer {
    /// Consumer username
    pub username: String,
    /// Issuer key the token was matched on
    pub key: String,
    /// `sub` claim
    pub subject: String,
    /// Verified claims
    pub claims: Claims,
}

/// Allow decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The path is on the skip list; no token was inspected.
    Skipped,
    /// The token was verified and is the subject's live token.
    Authenticated(AuthenticatedConsumer),
}

/// Runs the authentication decision for requests.
pub struct JwtAuthenticator {
    settings: PluginConfig,
    consumers: Arc<LiveConsumers>,
    directory: ConsumerDirectory,
    keys: KeyResolver,
    store: Arc<dyn RevocationStore>,
}

impl JwtAuthenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(
        settings: PluginConfig,
        consumers: Arc<LiveConsumers>,
        keys: KeyResolver,
        store: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            settings,
            consumers,
            directory: ConsumerDirectory::new(),
            keys,
            store,
        }
    }

    /// Plugin-level settings in use.
    #[must_use]
    pub fn settings(&self) -> &PluginConfig {
        &self.settings
    }

    /// Consumer provider in use.
    #[must_use]
    pub fn consumers(&self) -> &Arc<LiveConsumers> {
        &self.consumers
    }

    /// Key resolver in use.
    #[must_use]
    pub fn keys(&self) -> &KeyResolver {
        &self.keys
    }

    /// Decide whether `request` may proceed. Emits one audit event.
    pub async fn authenticate(&self, request: &AuthRequest<'_>) -> Result<Outcome, Denial> {
        let result = self.decide(request).await;
        audit::record(request.path(), &result);
        result
    }

    async fn decide(&self, request: &AuthRequest<'_>) -> Result<Outcome, Denial> {
        let settings = &self.settings;
        if settings.skip_paths.iter().any(|p| p == request.path()) {
            return Ok(Outcome::Skipped);
        }

        let raw = extract_token(request, &settings.header, &settings.query, &settings.cookie)
            .ok_or_else(|| Denial::new(DenyReason::TokenMissing))?;

        let token = JwtObject::parse(raw)
            .map_err(|e| Denial::with_detail(DenyReason::TokenInvalid, e))?;

        let issuer = token
            .issuer()
            .ok_or_else(|| Denial::new(DenyReason::MissingIssuer))?;

        let snapshot = self.consumers.snapshot();
        let consumer = self
            .directory
            .resolve(&snapshot, issuer)
            .map_err(|e| match e {
                DirectoryError::NoConsumers => Denial::new(DenyReason::MissingConsumer),
                DirectoryError::UnknownIssuer(_) => Denial::with_detail(DenyReason::UnknownIssuer, e),
            })?;

        let key = self
            .keys
            .verification_key(&consumer)
            .await
            .map_err(|e| Denial::with_detail(DenyReason::KeyUnavailable, e))?;

        let auth = &consumer.auth;
        let validation = token::default_validation(auth.algorithm, auth.lifetime_grace_period);
        let claims = token::verify(&token, &key, &validation).map_err(|e| {
            debug!(
                consumer = %consumer.username,
                token_alg = ?token.header().alg,
                consumer_alg = %auth.algorithm,
                "Signature or time claims rejected"
            );
            Denial::with_detail(DenyReason::VerificationFailed, e)
        })?;

        let subject = token
            .subject()
            .ok_or_else(|| Denial::new(DenyReason::MissingSubject))?;

        let stored = self
            .store
            .lookup_token(&auth.store, subject)
            .await
            .map_err(|e| {
                Denial::with_detail(
                    DenyReason::StoreUnavailable,
                    format!("{e} ({}:{})", auth.store.host, auth.store.port),
                )
            })?
            .ok_or_else(|| Denial::new(DenyReason::TokenRevokedOrUnknown))?;

        if !bool::from(stored.as_bytes().ct_eq(token.raw().as_bytes())) {
            return Err(Denial::new(DenyReason::TokenSuperseded));
        }

        debug!(consumer = %consumer.username, subject = %subject, "Token accepted");
        Ok(Outcome::Authenticated(AuthenticatedConsumer {
            username: consumer.username.clone(),
            key: auth.key.clone(),
            subject: subject.to_string(),
            claims,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_and_match_serde() {
        for reason in [
            DenyReason::TokenMissing,
            DenyReason::TokenInvalid,
            DenyReason::MissingIssuer,
            DenyReason::MissingConsumer,
            DenyReason::UnknownIssuer,
            DenyReason::KeyUnavailable,
            DenyReason::VerificationFailed,
            DenyReason::MissingSubject,
            DenyReason::StoreUnavailable,
            DenyReason::TokenRevokedOrUnknown,
            DenyReason::TokenSuperseded,
        ] {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, reason.code());
        }
    }

    #[test]
    fn service_errors_are_503_everything_else_401() {
        assert_eq!(DenyReason::KeyUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(DenyReason::StoreUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(DenyReason::TokenSuperseded.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::UnknownIssuer.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(DenyReason::MissingIssuer.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn denial_display_includes_detail() {
        let d = Denial::with_detail(DenyReason::TokenInvalid, "bad base64");
        assert_eq!(d.to_string(), "token_invalid: bad base64");
    }
}
