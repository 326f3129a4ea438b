//! Opaque token material: refresh tokens, OAuth state, client sessions.

use base64::Engine;
use rand::distr::Alphanumeric;
use rand::{Rng, RngCore, rng};
use sha2::{Digest, Sha256};

/// Generate a random refresh token (64 alphanumeric chars).
pub fn generate_refresh_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// SHA-256 hash a token for storage.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a cryptographic OAuth state parameter (CSRF token).
pub fn generate_state() -> String {
    random_urlsafe(24)
}

/// Generate an opaque browser session identifier.
pub fn generate_client_session() -> String {
    random_urlsafe(32)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
