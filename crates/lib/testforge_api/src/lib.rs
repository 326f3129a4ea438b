//! # testforge_api
//!
//! HTTP API library for Testforge.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use testforge_core::auth::AuthSessionManager;
use testforge_core::generation::GenerationEngine;
use testforge_core::provider::ProviderOAuthClient;
use testforge_core::store::Stores;
use testforge_core::workflow::WorkflowOrchestrator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::ApiConfig;
use crate::handlers::{auth, github, health, testcases};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// API configuration.
    pub config: ApiConfig,
    pub auth: Arc<AuthSessionManager>,
    pub workflow: Arc<WorkflowOrchestrator>,
    /// Provider client for read-only browsing calls.
    pub provider: Arc<dyn ProviderOAuthClient>,
    /// Store backend name, reported by the health endpoint.
    pub store_backend: &'static str,
}

impl AppState {
    /// Wire the session manager and orchestrator over `stores`.
    pub fn new(
        config: ApiConfig,
        stores: Stores,
        provider: Arc<dyn ProviderOAuthClient>,
        engine: Arc<dyn GenerationEngine>,
    ) -> Self {
        let auth = Arc::new(AuthSessionManager::new(
            config.session_config(),
            stores.tokens.clone(),
            stores.accounts.clone(),
            provider.clone(),
        ));
        let workflow = Arc::new(WorkflowOrchestrator::new(
            stores.jobs.clone(),
            provider.clone(),
            engine,
            config.orchestrator_config(),
        ));
        Self {
            config,
            auth,
            workflow,
            provider,
            store_backend: stores.backend,
        }
    }
}

/// CORS for the configured frontend origin, with credentials for cookies.
fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let origin = url::Url::parse(&config.frontend_url)
        .ok()
        .map(|u| u.origin().ascii_serialization())
        .and_then(|o| HeaderValue::from_str(&o).ok());
    match origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
            .allow_credentials(true),
        None => {
            warn!(frontend_url = %config.frontend_url, "unparseable frontend URL, allowing any origin");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    // Public routes (no auth required)
    let public = Router::new()
        .route(routes::GET_HEALTH, get(health::health_handler))
        .route(routes::GET_AUTH_GITHUB, get(auth::github_login_handler))
        .route(
            routes::GET_AUTH_GITHUB_CALLBACK,
            get(auth::github_callback_handler),
        )
        .route(routes::POST_AUTH_REFRESH, post(auth::refresh_handler))
        // Logout accepts expired access tokens, so it sits outside `require_auth`.
        .route(routes::POST_AUTH_LOGOUT, post(auth::logout_handler));

    // Protected routes (require auth)
    let protected = Router::new()
        .route(routes::GET_AUTH_ME, get(auth::me_handler))
        .route(routes::GET_GITHUB_REPOS, get(github::list_repos_handler))
        .route(routes::GET_GITHUB_FILES, get(github::list_files_handler))
        .route(routes::POST_GITHUB_CREATE_PR, post(github::create_pr_handler))
        .route(
            routes::POST_TESTCASES_GENERATE,
            post(testcases::generate_handler),
        )
        .route(routes::POST_TESTCASES_SAVE, post(testcases::save_handler))
        .route(routes::GET_TESTCASES_JOBS, get(testcases::list_jobs_handler))
        .route(routes::GET_TESTCASES_JOBS_ID, get(testcases::get_job_handler))
        .route(
            routes::POST_TESTCASES_JOBS_ID_RETRY,
            post(testcases::retry_job_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
