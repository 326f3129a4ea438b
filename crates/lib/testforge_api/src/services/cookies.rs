//! Cookie service: set/clear httpOnly auth cookies.
//!
//! The access and refresh cookies mirror the tokens handed out in the login
//! redirect, so a browser client can rely on either. The OAuth session cookie
//! binds a pending authorization to the browser that started it.

use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::routes::AUTH_SCOPE;

/// Cookie name for the access token.
pub const ACCESS_COOKIE: &str = "testforge_access";
/// Cookie name for the refresh token.
pub const REFRESH_COOKIE: &str = "testforge_refresh";
/// Cookie name for the OAuth client session.
pub const OAUTH_SESSION_COOKIE: &str = "testforge_oauth_session";

const OAUTH_SESSION_MAX_AGE_MINUTES: i64 = 10;

fn build(
    name: &'static str,
    value: String,
    path: &'static str,
    max_age: Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path(path)
        .max_age(max_age)
        .build()
}

pub fn access_cookie(token: &str, max_age_secs: i64, secure: bool) -> Cookie<'static> {
    build(ACCESS_COOKIE, token.to_string(), "/", Duration::seconds(max_age_secs), secure)
}

pub fn refresh_cookie(token: &str, max_age_secs: i64, secure: bool) -> Cookie<'static> {
    build(REFRESH_COOKIE, token.to_string(), "/", Duration::seconds(max_age_secs), secure)
}

/// Session cookie sent with the OAuth callback; lives as long as a pending state.
pub fn oauth_session_cookie(session: &str, secure: bool) -> Cookie<'static> {
    build(
        OAUTH_SESSION_COOKIE,
        session.to_string(),
        AUTH_SCOPE,
        Duration::minutes(OAUTH_SESSION_MAX_AGE_MINUTES),
        secure,
    )
}

pub fn clear_access_cookie(secure: bool) -> Cookie<'static> {
    build(ACCESS_COOKIE, String::new(), "/", Duration::ZERO, secure)
}

pub fn clear_refresh_cookie(secure: bool) -> Cookie<'static> {
    build(REFRESH_COOKIE, String::new(), "/", Duration::ZERO, secure)
}

pub fn clear_oauth_session_cookie(secure: bool) -> Cookie<'static> {
    build(OAUTH_SESSION_COOKIE, String::new(), AUTH_SCOPE, Duration::ZERO, secure)
}
