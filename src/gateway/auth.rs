//! JWT authentication middleware
//!
//! Runs [`JwtAuthenticator`] for every request. On allow the
//! [`AuthenticatedConsumer`] is inserted into request extensions for
//! downstream handlers; on deny the request never reaches them.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header::WWW_AUTHENTICATE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use crate::jwt_auth::{
    AuthRequest, AuthenticatedConsumer, Denial, DenyReason, JwtAuthenticator, Outcome,
};

/// Authenticate the request or answer with the denial.
pub async fn jwt_auth_middleware(
    State(authenticator): State<Arc<JwtAuthenticator>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let decision = {
        let view = AuthRequest::new(parts.uri.path(), parts.uri.query(), &parts.headers);
        authenticator.authenticate(&view).await
    };

    match decision {
        Ok(Outcome::Skipped) => {
            debug!(path = %parts.uri.path(), "Skip-listed path, not authenticating");
            next.run(Request::from_parts(parts, body)).await
        }
        Ok(Outcome::Authenticated(consumer)) => {
            parts.extensions.insert(consumer);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(denial) => denial_response(&denial),
    }
}

/// `(status, {"message", "reason"})`, with `WWW-Authenticate` on 401.
///
/// Token parse and verification diagnostics are returned as `detail`; details
/// of vault or store failures stay in the logs.
#[must_use]
pub fn denial_response(denial: &Denial) -> Response {
    let reason = denial.reason;
    let mut body = json!({
        "message": reason.message(),
        "reason": reason.code(),
    });
    if matches!(
        reason,
        DenyReason::TokenInvalid | DenyReason::VerificationFailed
    ) && !denial.detail.is_empty()
    {
        body["detail"] = json!(denial.detail);
    }

    let status = reason.status();
    if status == StatusCode::UNAUTHORIZED {
        (status, [(WWW_AUTHENTICATE, "Bearer")], Json(body)).into_response()
    } else {
        (status, Json(body)).into_response()
    }
}

/// Identity attached by [`jwt_auth_middleware`], if any.
#[must_use]
pub fn authenticated_consumer<B>(request: &Request<B>) -> Option<&AuthenticatedConsumer> {
    request.extensions().get::<AuthenticatedConsumer>()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 16).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn client_denial_is_401_with_challenge() {
        let response = denial_response(&Denial::new(DenyReason::TokenSuperseded));

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
        let body = body_json(response).await;
        assert_eq!(body["reason"], "token_superseded");
        assert_eq!(body["message"], "token has been superseded");
    }

    #[tokio::test]
    async fn service_denial_is_503_without_detail() {
        let response = denial_response(&Denial::with_detail(
            DenyReason::StoreUnavailable,
            "connect timed out after 1s (10.0.0.5:6379)",
        ));

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());
        let body = body_json(response).await;
        assert_eq!(body["reason"], "store_unavailable");
        assert!(body.get("detail").is_none());
    }

    #[tokio::test]
    async fn verification_detail_is_returned() {
        let response = denial_response(&Denial::with_detail(
            DenyReason::VerificationFailed,
            "ExpiredSignature",
        ));
        let body = body_json(response).await;
        assert_eq!(body["detail"], "ExpiredSignature");
    }
}
