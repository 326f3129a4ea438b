//! Authentication request handlers: GitHub OAuth login, refresh, logout.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use testforge_core::auth::tokens::generate_client_session;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    CallbackQuery, LoginQuery, LogoutResponse, RefreshRequest, TokenResponse, UserResponse,
};
use crate::services::auth::{
    auth_error_kind, login_error_url, login_success_url, request_access_token,
    with_session_cookies,
};
use crate::services::cookies::{
    OAUTH_SESSION_COOKIE, REFRESH_COOKIE, clear_access_cookie, clear_oauth_session_cookie,
    clear_refresh_cookie, oauth_session_cookie,
};

/// 302 Found to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

/// `GET /auth/github`: redirect to the GitHub authorize page.
pub async fn github_login_handler(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    jar: CookieJar,
) -> AppResult<(CookieJar, Response)> {
    let session = jar
        .get(OAUTH_SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(generate_client_session);

    let url = state
        .auth
        .begin_authorization(&session, query.redirect.as_deref())
        .await?;

    let jar = jar.add(oauth_session_cookie(&session, state.config.secure_cookies()));
    Ok((jar, found(&url)))
}

/// `GET /auth/github/callback`: finish the login and hand tokens to the frontend.
///
/// Always redirects: to the requested frontend path with tokens in the
/// fragment, or to the login page with `error=<kind>`.
pub async fn github_callback_handler(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    jar: CookieJar,
) -> (CookieJar, Response) {
    let frontend = state.config.frontend_base();
    let secure = state.config.secure_cookies();

    if let Some(error) = query.error.as_deref() {
        info!(provider_error = error, "authorization declined at provider");
        return (jar, found(&login_error_url(frontend, "access_denied")));
    }
    let (Some(code), Some(oauth_state)) = (query.code.as_deref(), query.state.as_deref()) else {
        return (jar, found(&login_error_url(frontend, "invalid_request")));
    };

    let session = jar.get(OAUTH_SESSION_COOKIE).map(|c| c.value().to_string());
    let jar = jar.add(clear_oauth_session_cookie(secure));

    match state
        .auth
        .complete_authorization(code, oauth_state, session.as_deref())
        .await
    {
        Ok(done) => {
            let url = login_success_url(frontend, done.redirect_path.as_deref(), &done.pair);
            let jar = with_session_cookies(jar, &done.pair, secure);
            (jar, found(&url))
        }
        Err(e) => {
            warn!(error = %e, "authorization callback failed");
            (jar, found(&login_error_url(frontend, auth_error_kind(&e))))
        }
    }
}

/// `GET /auth/me`: the signed-in account.
pub async fn me_handler(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> AppResult<Json<UserResponse>> {
    let account = state.auth.current_account(&user.subject_id).await?;
    Ok(Json(account.into()))
}

/// `POST /auth/refresh`: rotate a refresh token into a new pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> AppResult<(CookieJar, Json<TokenResponse>)> {
    let presented = match body {
        Ok(Json(body)) => body.refresh_token,
        // A browser may send no body and rely on the refresh cookie.
        Err(JsonRejection::MissingJsonContentType(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let refresh_token = presented
        .filter(|t| !t.is_empty())
        .or_else(|| jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()))
        .ok_or_else(|| AppError::Unauthenticated("Missing refresh token".into()))?;

    let pair = state.auth.refresh(&refresh_token).await?;
    let jar = with_session_cookies(jar, &pair, state.config.secure_cookies());
    Ok((jar, Json(TokenResponse::from(&pair))))
}

/// `POST /auth/logout`: revoke the session behind the presented access token.
pub async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> AppResult<(CookieJar, Json<LogoutResponse>)> {
    let token = request_access_token(&headers)
        .ok_or_else(|| AppError::Unauthenticated("Missing access token".into()))?;
    state.auth.logout(&token).await?;

    let secure = state.config.secure_cookies();
    let jar = jar
        .add(clear_access_cookie(secure))
        .add(clear_refresh_cookie(secure));
    Ok((jar, Json(LogoutResponse { success: true })))
}
