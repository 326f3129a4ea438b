//! Testforge API server binary.
//!
//! Configuration comes from the environment (a `.env` file is honoured);
//! the flags below override the few settings worth changing per run.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use testforge_api::config::ApiConfig;
use testforge_core::generation::GenerationEngine;
use testforge_core::generation::http::HttpGenerationEngine;
use testforge_core::generation::template::TemplateGenerationEngine;
use testforge_core::provider::github::GithubClient;
use testforge_core::store::{Stores, postgres};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI arguments for the API server.
#[derive(Parser, Debug)]
#[command(name = "testforge_server", about = "Testforge API server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// PostgreSQL connection URL. In-memory stores are used when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 5)]
    max_connections: u32,

    /// How often expired OAuth states are swept, in seconds.
    #[arg(long, default_value_t = 300)]
    cleanup_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,testforge_api=debug,testforge_core=debug",
                )
            }),
        )
        .init();

    let args = Args::parse();

    let mut config = ApiConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.database_url.is_some() {
        config.database_url = args.database_url;
    }
    info!(?config, "starting testforge_server");

    let stores = match config.database_url.as_deref() {
        Some(url) => {
            info!(max_connections = args.max_connections, "configuring connection pool");
            let pool = PgPoolOptions::new()
                .max_connections(args.max_connections)
                .acquire_timeout(Duration::from_secs(30))
                .connect(url)
                .await?;
            info!("running database migrations");
            postgres::migrate(&pool).await?;
            Stores::postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory stores; state is lost on restart");
            Stores::in_memory()
        }
    };

    let provider = Arc::new(GithubClient::new(config.github_config())?);
    let engine: Arc<dyn GenerationEngine> = match config.generation_engine_url.as_deref() {
        Some(url) => Arc::new(HttpGenerationEngine::new(
            url,
            config.generation_api_key.clone(),
        )),
        None => Arc::new(TemplateGenerationEngine::new()),
    };
    info!(store = stores.backend, engine = engine.name(), "backends ready");

    let state = testforge_api::AppState::new(config.clone(), stores, provider, engine);
    let cleanup = state
        .auth
        .clone()
        .spawn_pending_cleanup(Duration::from_secs(args.cleanup_interval_secs.max(1)));

    let app = testforge_api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    cleanup.abort();
    result?;
    info!("server stopped");
    Ok(())
}
