//! JWT access token generation and verification.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tracing::{info, warn};

use super::AuthError;
use crate::models::auth::TokenClaims;

/// Default access token lifetime: 1 hour.
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Generate a signed JWT access token (HS256) bound to a token chain.
///
/// Returns the token and its expiry.
pub fn generate_access_token(
    subject_id: &str,
    chain_id: &str,
    issued_at: DateTime<Utc>,
    ttl: Duration,
    secret: &[u8],
) -> Result<(String, DateTime<Utc>), AuthError> {
    let expires_at = issued_at + ttl;
    let claims = TokenClaims {
        sub: subject_id.to_string(),
        sid: chain_id.to_string(),
        exp: expires_at.timestamp(),
        iat: issued_at.timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::TokenError(format!("jwt encode: {e}")))?;
    Ok((token, expires_at))
}

/// Verify a JWT access token, returning the claims on success.
pub fn verify_access_token(token: &str, secret: &[u8]) -> Option<TokenClaims> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    validation.leeway = 0;
    decode_with(token, secret, &validation)
}

/// Verify the signature only, accepting expired tokens.
///
/// Used by logout: a client whose access token has just lapsed must still be
/// able to end its session.
pub fn verify_signature_only(token: &str, secret: &[u8]) -> Option<TokenClaims> {
    let mut validation = Validation::default();
    validation.validate_exp = false;
    decode_with(token, secret, &validation)
}

fn decode_with(token: &str, secret: &[u8], validation: &Validation) -> Option<TokenClaims> {
    let key = DecodingKey::from_secret(secret);
    decode::<TokenClaims>(token, &key, validation)
        .ok()
        .map(|data| data.claims)
}

/// Env vars consulted for the signing secret, in order.
const SECRET_ENV_VARS: [&str; 2] = ["JWT_SECRET", "AUTH_SECRET"];

/// Signing secret from the environment, else one persisted under the user
/// data dir so tokens survive restarts.
pub fn resolve_jwt_secret() -> String {
    if let Some(secret) = SECRET_ENV_VARS
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    {
        return secret;
    }
    let path = jwt_secret_path();
    match load_or_create_secret(&path) {
        Ok(secret) => secret,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot persist JWT secret, issued tokens end with this process");
            random_secret()
        }
    }
}

fn random_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// Read the secret at `path`, creating it when missing or empty.
fn load_or_create_secret(path: &Path) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(existing) if !existing.trim().is_empty() => return Ok(existing.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let secret = random_secret();
    std::fs::write(path, &secret)?;
    info!(path = %path.display(), "generated new JWT secret");
    Ok(secret)
}

fn jwt_secret_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("testforge")
        .join("jwt-secret")
}
