//! Authentication middleware: access token extraction and validation.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::AppState;
use crate::error::AppError;
use crate::services::auth::request_access_token;

/// The validated subject, stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub subject_id: String,
}

/// Axum middleware: takes the bearer token (or the access cookie), validates
/// it locally, and injects [`AuthenticatedUser`] into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request_access_token(request.headers())
        .ok_or_else(|| AppError::Unauthenticated("Missing access token".into()))?;

    let subject_id = state.auth.validate_access_token(&token).await?;

    request
        .extensions_mut()
        .insert(AuthenticatedUser { subject_id });

    Ok(next.run(request).await)
}
