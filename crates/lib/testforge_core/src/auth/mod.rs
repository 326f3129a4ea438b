//! Authentication: OAuth login, token issuance, rotation and revocation.
//!
//! Access tokens are HS256 JWTs carrying the subject and the token chain
//! (`sid`). Refresh tokens are opaque, single-use, and stored as SHA-256
//! hashes. Validating an access token never calls the provider: it checks the
//! signature, expiry, and the chain's revocation state in the local store.

pub mod jwt;
pub mod session;
pub mod tokens;

pub use session::{AuthSessionManager, CompletedAuthorization, SessionConfig};

use thiserror::Error;

use crate::secrets::SecretError;
use crate::store::StoreError;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid authorization state: {0}")]
    InvalidState(String),

    #[error("Provider rejected authorization: {0}")]
    UpstreamAuth(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),
}
