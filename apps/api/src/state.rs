use std::sync::Arc;

use sqlx::PgPool;

use crate::query::history::QueryHistory;
use crate::query::orchestrator::QueryOrchestrator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Session and profile lookups.
    pub db: PgPool,
    pub orchestrator: Arc<QueryOrchestrator>,
    pub history: Arc<dyn QueryHistory>,
}
