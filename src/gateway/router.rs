//! HTTP router: health, optional token issuance, and the forward-auth
//! fallback that answers for every other path.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    BoxError, Json, Router,
    error_handling::HandleErrorLayer,
    extract::{Query, State},
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tower::timeout::TimeoutLayer;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, warn};

use super::auth::{authenticated_consumer, jwt_auth_middleware};
use crate::jwt_auth::sign::{SignError, parse_payload, sign_for_key};
use crate::jwt_auth::token::Claims;
use crate::jwt_auth::JwtAuthenticator;

/// Path of the token issuance endpoint.
pub const SIGN_PATH: &str = "/jwt/sign";

/// Response header naming the authenticated consumer.
pub const CONSUMER_HEADER: &str = "x-consumer-username";

/// Shared application state
pub struct AppState {
    /// Request authenticator
    pub authenticator: Arc<JwtAuthenticator>,
    /// Whether `GET /jwt/sign` is routed
    pub sign_endpoint: bool,
    /// Upper bound on handling one request, authentication included
    pub request_timeout: Duration,
}

/// Build the router with all routes behind the authentication middleware.
///
/// `/health` and [`SIGN_PATH`] pass through only if they are on the
/// authenticator's skip list.
pub fn create_router(state: Arc<AppState>) -> Router {
    let authenticator = Arc::clone(&state.authenticator);
    let request_timeout = state.request_timeout;

    let mut router = Router::new().route("/health", get(health_handler));
    if state.sign_endpoint {
        router = router.route(SIGN_PATH, get(sign_handler));
    }

    router
        .fallback(forward_auth_handler)
        .layer(middleware::from_fn_with_state(
            authenticator,
            jwt_auth_middleware,
        ))
        .layer((
            HandleErrorLayer::new(handle_timeout),
            TimeoutLayer::new(request_timeout),
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.authenticator.consumers().snapshot();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "config_version": snapshot.version,
        "consumers": snapshot.consumers.len(),
    }))
}

/// Reached only after the middleware allowed the request.
async fn forward_auth_handler(request: Request<axum::body::Body>) -> Response {
    let mut response = StatusCode::OK.into_response();
    if let Some(consumer) = authenticated_consumer(&request) {
        if let Ok(value) = HeaderValue::from_str(&consumer.username) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(CONSUMER_HEADER), value);
        }
    }
    response
}

#[derive(Debug, Deserialize)]
struct SignParams {
    key: Option<String>,
    payload: Option<String>,
}

async fn sign_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SignParams>,
) -> Response {
    let Some(key) = params.key.filter(|k| !k.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing key in query");
    };

    let extra = match params.payload.as_deref().map(parse_payload) {
        None => Claims::new(),
        Some(Ok(claims)) => claims,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let authenticator = &state.authenticator;
    let snapshot = authenticator.consumers().snapshot();
    match sign_for_key(authenticator.keys(), &snapshot, &key, extra).await {
        Ok(token) => token.into_response(),
        Err(SignError::UnknownConsumer(_)) => {
            error_response(StatusCode::NOT_FOUND, "Invalid user key")
        }
        Err(SignError::InvalidPayload(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(e) => {
            error!(key = %key, error = %e, "Token issuance failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "failed to sign jwt")
        }
    }
}

async fn handle_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        warn!("Request timed out");
        error_response(StatusCode::GATEWAY_TIMEOUT, "request timed out")
    } else {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}
