//! HTTP surface: authentication middleware, router and server

pub mod auth;
pub mod router;
mod server;

pub use auth::{authenticated_consumer, denial_response, jwt_auth_middleware};
pub use router::{AppState, CONSUMER_HEADER, SIGN_PATH, create_router};
pub use server::Gateway;
