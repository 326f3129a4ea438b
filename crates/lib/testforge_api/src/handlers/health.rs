//! Liveness endpoint.

use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::models::HealthResponse;

/// `GET /health`: version and the backends in use.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: testforge_core::version().into(),
        store: state.store_backend.into(),
        engine: state.workflow.engine_name().into(),
    })
}
