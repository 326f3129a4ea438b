//! Authentication helpers shared by the auth handlers and middleware.
//!
//! Token issuance itself lives in `testforge_core::auth::AuthSessionManager`;
//! this module only deals with how tokens travel over HTTP.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum_extra::extract::CookieJar;
use testforge_core::auth::AuthError;
use testforge_core::models::auth::TokenPair;
use url::form_urlencoded;

use super::cookies::{ACCESS_COOKIE, access_cookie, refresh_cookie};

/// Frontend route that receives tokens when no redirect was requested.
pub const DEFAULT_LOGIN_LANDING: &str = "/auth/callback";

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Access token from the bearer header, falling back to the access cookie.
pub fn request_access_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = bearer_token(headers) {
        return Some(token.to_string());
    }
    CookieJar::from_headers(headers)
        .get(ACCESS_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
}

/// Attach access and refresh cookies for `pair`.
pub fn with_session_cookies(jar: CookieJar, pair: &TokenPair, secure: bool) -> CookieJar {
    let refresh_max_age = (pair.refresh_expires_at - pair.issued_at).num_seconds();
    jar.add(access_cookie(&pair.access_token, pair.expires_in(), secure))
        .add(refresh_cookie(&pair.refresh_token, refresh_max_age, secure))
}

/// Frontend URL carrying the new tokens in its fragment.
///
/// The fragment never reaches a server, so tokens stay out of access logs.
pub fn login_success_url(frontend_base: &str, redirect_path: Option<&str>, pair: &TokenPair) -> String {
    let fragment = form_urlencoded::Serializer::new(String::new())
        .append_pair("access_token", &pair.access_token)
        .append_pair("refresh_token", &pair.refresh_token)
        .append_pair("expires_in", &pair.expires_in().to_string())
        .append_pair("token_type", "Bearer")
        .finish();
    let path = redirect_path.unwrap_or(DEFAULT_LOGIN_LANDING);
    format!("{frontend_base}{path}#{fragment}")
}

/// Frontend login page reporting `kind`.
pub fn login_error_url(frontend_base: &str, kind: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("error", kind)
        .finish();
    format!("{frontend_base}/login?{query}")
}

/// Stable error kind reported to the frontend after a failed login.
pub fn auth_error_kind(e: &AuthError) -> &'static str {
    match e {
        AuthError::Configuration(_) => "configuration_error",
        AuthError::InvalidState(_) => "invalid_state",
        AuthError::UpstreamAuth(_) => "upstream_auth_error",
        AuthError::Unauthenticated(_) => "unauthenticated",
        AuthError::ValidationError(_) => "validation_error",
        AuthError::TokenError(_) | AuthError::Store(_) | AuthError::Secret(_) => "internal_error",
    }
}
