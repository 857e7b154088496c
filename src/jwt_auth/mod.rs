//! JWT authentication with revocation cross-check.
//!
//! [`JwtAuthenticator`] is the entry point: it takes an [`AuthRequest`] and
//! returns either an [`Outcome`] or a [`Denial`].

pub mod audit;
pub mod directory;
pub mod extract;
pub mod keys;
pub mod pipeline;
pub mod sign;
pub mod token;

pub use directory::{Consumer, ConsumerDirectory, ConsumerSnapshot};
pub use extract::{AuthRequest, extract_token, strip_bearer};
pub use keys::{KeyError, KeyPair, KeyResolver, KeyUse};
pub use pipeline::{AuthenticatedConsumer, Denial, DenyReason, JwtAuthenticator, Outcome};
pub use sign::{SignError, sign_for_key, sign_token};
