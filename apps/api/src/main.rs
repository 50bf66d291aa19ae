mod access;
mod auth;
mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod query;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::LlmClient;
use crate::query::executor::PgQueryExecutor;
use crate::query::history::PgQueryHistory;
use crate::query::model::LlmQueryModel;
use crate::query::orchestrator::{OrchestratorSettings, QueryOrchestrator};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting placement analytics API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url, config.db_max_connections).await?;

    // Initialize LLM client
    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    // Wire the query pipeline
    let history = Arc::new(PgQueryHistory::new(db.clone()));
    let orchestrator = QueryOrchestrator::new(
        Arc::new(LlmQueryModel::new(llm)),
        Arc::new(PgQueryExecutor::new(db.clone(), config.query_timeout)),
        history.clone(),
        OrchestratorSettings {
            query_timeout: config.query_timeout,
            model_timeout: config.model_timeout,
        },
    );
    info!(
        query_timeout_ms = config.query_timeout.as_millis() as u64,
        model_timeout_ms = config.model_timeout.as_millis() as u64,
        "Query orchestrator ready"
    );

    // Build app state
    let state = AppState {
        db,
        orchestrator: Arc::new(orchestrator),
        history,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins to the portal frontend

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
