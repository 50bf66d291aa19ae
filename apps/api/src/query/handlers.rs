use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::context::resolve_caller_context;
use crate::auth::SessionUser;
use crate::errors::AppError;
use crate::models::query::AiQueryRow;
use crate::query::history::clamp_limit;
use crate::query::orchestrator::QueryRequest;
use crate::query::templates::{
    categories_for_role, templates_for_role, templates_in_category, QueryTemplate,
};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct TemplatesQuery {
    pub category: Option<String>,
}

#[derive(Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<&'static QueryTemplate>,
    pub categories: Vec<&'static str>,
}

#[derive(Serialize)]
pub struct SuggestionsResponse {
    pub suggestions: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearHistoryResponse {
    pub success: bool,
    pub deleted: u64,
}

/// POST /api/ai/query
/// Runs a natural-language or template query for the caller. Failures keep
/// the query result shape, with the status code of the failure class.
pub async fn handle_query(
    State(state): State<AppState>,
    user: SessionUser,
    Json(req): Json<QueryRequest>,
) -> Result<Response, AppError> {
    let ctx = resolve_caller_context(&state.db, &user).await?;

    match state.orchestrator.execute(&ctx, &req).await {
        Ok(result) => Ok(Json(result).into_response()),
        Err(failure) => {
            let status = failure.status_code();
            Ok((status, Json(failure.into_result(ctx.role))).into_response())
        }
    }
}

/// GET /api/ai/query?limit=N
pub async fn handle_history(
    State(state): State<AppState>,
    user: SessionUser,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<AiQueryRow>>, AppError> {
    let rows = state
        .history
        .list(&user.user_id, clamp_limit(params.limit))
        .await?;
    Ok(Json(rows))
}

/// DELETE /api/ai/query
pub async fn handle_clear_history(
    State(state): State<AppState>,
    user: SessionUser,
) -> Result<Json<ClearHistoryResponse>, AppError> {
    let deleted = state.history.clear(&user.user_id).await?;
    Ok(Json(ClearHistoryResponse {
        success: true,
        deleted,
    }))
}

/// DELETE /api/ai/query/:id
pub async fn handle_delete_query(
    State(state): State<AppState>,
    user: SessionUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.history.delete(&user.user_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Query {id} not found")))
    }
}

/// GET /api/ai/templates?category=...
pub async fn handle_templates(
    user: SessionUser,
    Query(params): Query<TemplatesQuery>,
) -> Json<TemplatesResponse> {
    let templates = match params.category.as_deref() {
        Some(category) => templates_in_category(user.role, category),
        None => templates_for_role(user.role),
    };
    Json(TemplatesResponse {
        templates,
        categories: categories_for_role(user.role),
    })
}

/// GET /api/ai/suggestions
pub async fn handle_suggestions(
    State(state): State<AppState>,
    user: SessionUser,
) -> Result<Json<SuggestionsResponse>, AppError> {
    let ctx = resolve_caller_context(&state.db, &user).await?;
    let suggestions = state.orchestrator.suggestions(&ctx).await;
    Ok(Json(SuggestionsResponse { suggestions }))
}
