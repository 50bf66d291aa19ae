pub mod health;

use axum::{
    routing::{delete, get},
    Router,
};

use crate::query::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Analytics queries
        .route(
            "/api/ai/query",
            get(handlers::handle_history)
                .post(handlers::handle_query)
                .delete(handlers::handle_clear_history),
        )
        .route("/api/ai/query/:id", delete(handlers::handle_delete_query))
        .route("/api/ai/templates", get(handlers::handle_templates))
        .route("/api/ai/suggestions", get(handlers::handle_suggestions))
        .with_state(state)
}
