//! Application error types.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use testforge_core::auth::AuthError;
use testforge_core::provider::ProviderError;
use testforge_core::workflow::WorkflowError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    /// Status code and stable error kind.
    pub fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = match &self {
            AppError::Internal(detail) => {
                error!(%detail, "internal error");
                "Internal server error".to_string()
            }
            AppError::Configuration(detail) => {
                error!(%detail, "configuration error");
                detail.clone()
            }
            AppError::Validation(m)
            | AppError::Unauthenticated(m)
            | AppError::Forbidden(m)
            | AppError::NotFound(m)
            | AppError::Conflict(m)
            | AppError::InvalidState(m)
            | AppError::Upstream(m)
            | AppError::Timeout(m) => m.clone(),
        };
        let body = Json(ErrorResponse {
            error: kind.to_string(),
            message,
        });
        (status, body).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::Validation(e.body_text())
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Configuration(msg) => AppError::Configuration(msg),
            AuthError::InvalidState(msg) => AppError::Validation(msg),
            AuthError::UpstreamAuth(msg) => AppError::Upstream(msg),
            AuthError::Unauthenticated(msg) => AppError::Unauthenticated(msg),
            AuthError::ValidationError(msg) => AppError::Validation(msg),
            AuthError::TokenError(msg) => AppError::Internal(msg),
            AuthError::Store(e) => AppError::Internal(e.to_string()),
            AuthError::Secret(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        let message = e.to_string();
        match e {
            WorkflowError::Validation(msg) => AppError::Validation(msg),
            WorkflowError::NotFound(msg) => AppError::NotFound(msg),
            WorkflowError::Forbidden(msg) => AppError::Forbidden(msg),
            WorkflowError::InvalidState { .. } => AppError::InvalidState(message),
            WorkflowError::Conflict(msg) => AppError::Conflict(msg),
            WorkflowError::Upstream(msg) => AppError::Upstream(msg),
            WorkflowError::Timeout(_) => AppError::Timeout(message),
            WorkflowError::Store(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        let message = e.to_string();
        match e {
            ProviderError::NotConfigured(msg) => AppError::Configuration(msg),
            ProviderError::NotFound(msg) => AppError::NotFound(msg),
            ProviderError::Unauthorized(_) => AppError::Unauthenticated(message),
            ProviderError::Forbidden(msg) => AppError::Forbidden(msg),
            ProviderError::Timeout(_) => AppError::Timeout(message),
            ProviderError::RateLimited(_)
            | ProviderError::Transport(_)
            | ProviderError::Upstream { .. }
            | ProviderError::InvalidResponse(_) => AppError::Upstream(message),
        }
    }
}
