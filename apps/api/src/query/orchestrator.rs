//! The natural-language query pipeline.
//!
//! Classify → Generate → Validate → Inject → Execute → (RetryOnce) → Persist.
//! Every collaborator is a trait object, so the whole flow runs against fakes
//! in tests.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::access::context::CallerContext;
use crate::access::policy::Role;
use crate::models::query::ChartType;
use crate::query::classifier::{classify, friendly_response, references_permitted_table, Intent};
use crate::query::executor::{DbError, QueryExecutor};
use crate::query::filters::{add_role_based_filters, FilterError};
use crate::query::history::{NewQueryRecord, QueryHistory};
use crate::query::model::{GeneratedQuery, ModelError, QueryModel, RetryHint, SqlRequest};
use crate::query::templates::{template_by_id, templates_for_role};
use crate::query::validator::{strip_terminator, validate, SqlValidationError};

/// One generation plus at most one corrective retry.
pub const MAX_ATTEMPTS: u32 = 2;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);
const RECENT_QUERIES_FOR_SUGGESTIONS: i64 = 5;
const MAX_SUGGESTIONS: usize = 5;

const INSIGHTS_FALLBACK: &str = "Unable to generate insights at this time.";
const EXECUTION_FAILED: &str =
    "Failed to execute query. Please try again or rephrase your question.";
const GENERATION_FAILED: &str =
    "Failed to generate a query. Please try again or rephrase your question.";
const MODEL_TIMED_OUT: &str = "The AI service took too long to respond. Please try again.";
const QUOTA_EXCEEDED: &str =
    "AI service quota exceeded. Please try again later or upgrade your API plan.";
const PROFILE_INCOMPLETE: &str =
    "Complete your profile before running analytics queries on your own data.";

// ────────────────────────────────────────────────────────────────────────────
// Request / result types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub template_id: Option<String>,
}

/// Caller-facing result, success or failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<ChartType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_quota_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

impl QueryExecutionResult {
    /// A prose answer with no data behind it (greeting, help, general question).
    fn conversational(text: String) -> Self {
        Self {
            success: true,
            data: Some(Vec::new()),
            insights: Some(text),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Template not found")]
    TemplateNotFound,

    #[error("Unauthorized access to this template")]
    TemplateRoleMismatch,

    #[error("{0}")]
    Validation(#[from] SqlValidationError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("Query took too long to execute. Please try a simpler query.")]
    Timeout,

    #[error("AI service quota exceeded. Please try again later or upgrade your API plan.")]
    QuotaExceeded { retry_after: Option<String> },

    #[error("Query execution failed: {0}")]
    Execution(DbError),

    #[error(transparent)]
    Model(ModelError),
}

impl From<ModelError> for QueryError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::QuotaExceeded { retry_after } => QueryError::QuotaExceeded { retry_after },
            other => QueryError::Model(other),
        }
    }
}

/// A failed request together with the last SQL that was attempted, if any.
#[derive(Debug)]
pub struct QueryFailure {
    pub kind: QueryError,
    pub sql: Option<String>,
}

impl QueryFailure {
    fn new(kind: impl Into<QueryError>, sql: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            sql,
        }
    }

    fn bare(kind: impl Into<QueryError>) -> Self {
        Self::new(kind, None)
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            QueryError::EmptyQuery | QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::Filter(FilterError::MissingIdentity(_)) => StatusCode::BAD_REQUEST,
            QueryError::TemplateNotFound => StatusCode::NOT_FOUND,
            QueryError::TemplateRoleMismatch => StatusCode::FORBIDDEN,
            QueryError::Timeout | QueryError::Model(ModelError::Timeout) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            QueryError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueryError::Filter(_) | QueryError::Execution(_) | QueryError::Model(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show any caller.
    pub fn user_message(&self) -> String {
        match &self.kind {
            QueryError::Filter(FilterError::MissingIdentity(_)) => PROFILE_INCOMPLETE.to_string(),
            QueryError::Filter(_) | QueryError::Execution(_) => EXECUTION_FAILED.to_string(),
            QueryError::Model(ModelError::Timeout) => MODEL_TIMED_OUT.to_string(),
            QueryError::Model(_) => GENERATION_FAILED.to_string(),
            QueryError::QuotaExceeded { .. } => QUOTA_EXCEEDED.to_string(),
            other => other.to_string(),
        }
    }

    /// Renders the failure for `role`. Only admins see SQL and database messages.
    pub fn into_result(self, role: Role) -> QueryExecutionResult {
        let mut error = self.user_message();
        let reveal = role == Role::Admin;
        if reveal {
            if let QueryError::Execution(db) = &self.kind {
                error = format!("{error} ({})", db.message);
            }
        }

        let (is_quota_error, retry_after) = match self.kind {
            QueryError::QuotaExceeded { retry_after } => (Some(true), retry_after),
            _ => (None, None),
        };

        QueryExecutionResult {
            success: false,
            error: Some(error),
            sql: if reveal { self.sql } else { None },
            is_quota_error,
            retry_after,
            ..Default::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Wall-clock bound on one database execution.
    pub query_timeout: Duration,
    /// Bound on each model call.
    pub model_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// What the caller asked for, after template resolution.
struct QueryPlan {
    /// Text sent to the model.
    prompt: String,
    /// Text stored in history and shown to the insights model.
    question: String,
    fixed_chart: Option<ChartType>,
    is_template: bool,
}

enum ExecutionFailure {
    Timeout,
    Database(DbError),
}

pub struct QueryOrchestrator {
    model: Arc<dyn QueryModel>,
    executor: Arc<dyn QueryExecutor>,
    history: Arc<dyn QueryHistory>,
    settings: OrchestratorSettings,
}

impl QueryOrchestrator {
    pub fn new(
        model: Arc<dyn QueryModel>,
        executor: Arc<dyn QueryExecutor>,
        history: Arc<dyn QueryHistory>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            model,
            executor,
            history,
            settings,
        }
    }

    pub async fn execute(
        &self,
        ctx: &CallerContext,
        request: &QueryRequest,
    ) -> Result<QueryExecutionResult, QueryFailure> {
        let started = Instant::now();
        let plan = plan(ctx.role, request).map_err(QueryFailure::bare)?;

        if !plan.is_template {
            let intent = classify(&plan.prompt);
            if intent != Intent::Data {
                info!(role = %ctx.role, ?intent, "Answered without generating SQL");
                return Ok(QueryExecutionResult::conversational(friendly_response(
                    intent, ctx.role,
                )));
            }
        }

        let mut generated = self
            .generate_sql(&plan.prompt, ctx, None)
            .await
            .map_err(QueryFailure::bare)?;

        if !references_permitted_table(&generated.sql, ctx.role) {
            return self.answer_generally(&plan, ctx.role, &generated).await;
        }

        let mut attempt = 1;
        loop {
            let candidate = strip_terminator(generated.sql.trim()).to_string();

            if let Err(e) = validate(&candidate, ctx.role) {
                warn!(role = %ctx.role, sql = %candidate, "Generated SQL rejected: {e}");
                return Err(QueryFailure::new(e, Some(candidate)));
            }

            let final_sql = add_role_based_filters(&candidate, ctx)
                .map_err(|e| {
                    warn!(role = %ctx.role, sql = %candidate, "Row filtering failed: {e}");
                    QueryFailure::new(e, Some(candidate.clone()))
                })?;

            match self.run(&final_sql).await {
                Ok(rows) => {
                    info!(
                        role = %ctx.role,
                        attempt,
                        rows = rows.len(),
                        "Analytics query executed"
                    );
                    return Ok(self
                        .finish(ctx, &plan, &generated, final_sql, rows, started)
                        .await);
                }
                Err(ExecutionFailure::Timeout) => {
                    warn!(role = %ctx.role, sql = %final_sql, "Analytics query timed out");
                    return Err(QueryFailure::new(QueryError::Timeout, Some(final_sql)));
                }
                Err(ExecutionFailure::Database(db_error)) => {
                    if attempt < MAX_ATTEMPTS && db_error.is_recoverable() {
                        warn!(
                            role = %ctx.role,
                            code = ?db_error.code,
                            "Generated SQL failed, requesting a corrected query: {}",
                            db_error.message
                        );
                        let hint = RetryHint {
                            previous_sql: &candidate,
                            error_message: &db_error.message,
                        };
                        generated = self
                            .generate_sql(&plan.prompt, ctx, Some(hint))
                            .await
                            .map_err(|e| QueryFailure::new(e, Some(final_sql.clone())))?;
                        attempt += 1;
                        continue;
                    }

                    error!(
                        role = %ctx.role,
                        code = ?db_error.code,
                        sql = %final_sql,
                        "Analytics query failed: {}",
                        db_error.message
                    );
                    return Err(QueryFailure::new(
                        QueryError::Execution(db_error),
                        Some(final_sql),
                    ));
                }
            }
        }
    }

    /// Follow-up questions for the caller, falling back to template names
    /// when the model is unavailable.
    pub async fn suggestions(&self, ctx: &CallerContext) -> Vec<String> {
        let recent: Vec<String> = match self
            .history
            .list(&ctx.user_id, RECENT_QUERIES_FOR_SUGGESTIONS)
            .await
        {
            Ok(rows) => rows.into_iter().map(|r| r.query).collect(),
            Err(e) => {
                warn!("Could not load recent queries for suggestions: {e}");
                Vec::new()
            }
        };

        let generated = timeout(
            self.settings.model_timeout,
            self.model.generate_suggestions(ctx.role, &recent),
        )
        .await;

        match generated {
            Ok(Ok(list)) if !list.is_empty() => list.into_iter().take(MAX_SUGGESTIONS).collect(),
            Ok(Err(e)) => {
                warn!("Suggestion generation failed: {e}");
                fallback_suggestions(ctx.role)
            }
            _ => fallback_suggestions(ctx.role),
        }
    }

    async fn generate_sql(
        &self,
        prompt: &str,
        ctx: &CallerContext,
        retry: Option<RetryHint<'_>>,
    ) -> Result<GeneratedQuery, QueryError> {
        let request = SqlRequest {
            prompt,
            context: ctx,
            retry,
        };
        match timeout(self.settings.model_timeout, self.model.generate_sql(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(QueryError::Model(ModelError::Timeout)),
        }
    }

    async fn run(&self, sql: &str) -> Result<Vec<Value>, ExecutionFailure> {
        match timeout(self.settings.query_timeout, self.executor.execute(sql)).await {
            Err(_) => Err(ExecutionFailure::Timeout),
            Ok(Err(e)) if e.is_statement_timeout() => Err(ExecutionFailure::Timeout),
            Ok(Err(e)) => Err(ExecutionFailure::Database(e)),
            Ok(Ok(rows)) => Ok(rows),
        }
    }

    async fn answer_generally(
        &self,
        plan: &QueryPlan,
        role: Role,
        generated: &GeneratedQuery,
    ) -> Result<QueryExecutionResult, QueryFailure> {
        info!(role = %role, "No permitted table referenced, answering as a general question");
        let answer = timeout(
            self.settings.model_timeout,
            self.model.generate_general_response(&plan.question, role),
        )
        .await;

        match answer {
            Ok(Ok(text)) => Ok(QueryExecutionResult::conversational(text)),
            Ok(Err(ModelError::QuotaExceeded { retry_after })) => Err(QueryFailure::bare(
                QueryError::QuotaExceeded { retry_after },
            )),
            failed => {
                if let Ok(Err(e)) = &failed {
                    warn!("General response failed: {e}");
                }
                if generated.explanation.trim().is_empty() {
                    Err(QueryFailure::bare(QueryError::Model(ModelError::Unavailable(
                        "no general answer".to_string(),
                    ))))
                } else {
                    Ok(QueryExecutionResult::conversational(
                        generated.explanation.clone(),
                    ))
                }
            }
        }
    }

    async fn finish(
        &self,
        ctx: &CallerContext,
        plan: &QueryPlan,
        generated: &GeneratedQuery,
        final_sql: String,
        rows: Vec<Value>,
        started: Instant,
    ) -> QueryExecutionResult {
        let chart_type = plan.fixed_chart.unwrap_or_else(|| generated.chart());

        let insights = match timeout(
            self.settings.model_timeout,
            self.model
                .generate_insights(&plan.question, &rows, chart_type),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Err(e)) => {
                warn!("Insight generation failed: {e}");
                INSIGHTS_FALLBACK.to_string()
            }
            _ => INSIGHTS_FALLBACK.to_string(),
        };

        let elapsed_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);

        let record = NewQueryRecord {
            user_id: ctx.user_id.clone(),
            role: ctx.role,
            query: plan.question.clone(),
            generated_sql: final_sql.clone(),
            results: Value::Array(rows.clone()),
            insights: Some(insights.clone()),
            chart_type,
            is_template: plan.is_template,
            execution_time_ms: elapsed_ms,
        };
        let query_id = match self.history.record(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(user_id = %ctx.user_id, "Failed to save query history: {e}");
                None
            }
        };

        QueryExecutionResult {
            success: true,
            data: Some(rows),
            insights: Some(insights),
            chart_type: Some(chart_type),
            visualization: generated.visualization.clone(),
            query_id,
            sql: Some(final_sql),
            explanation: Some(generated.explanation.clone()),
            execution_time: Some(format!("{elapsed_ms}ms")),
            ..Default::default()
        }
    }
}

fn plan(role: Role, request: &QueryRequest) -> Result<QueryPlan, QueryError> {
    let query = request.query.trim();

    match request.template_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            let template = template_by_id(id).ok_or(QueryError::TemplateNotFound)?;
            if template.role != role {
                return Err(QueryError::TemplateRoleMismatch);
            }
            Ok(QueryPlan {
                prompt: template.prompt.to_string(),
                question: if query.is_empty() {
                    template.name.to_string()
                } else {
                    query.to_string()
                },
                fixed_chart: Some(template.chart_type),
                is_template: true,
            })
        }
        None if query.is_empty() => Err(QueryError::EmptyQuery),
        None => Ok(QueryPlan {
            prompt: query.to_string(),
            question: query.to_string(),
            fixed_chart: None,
            is_template: false,
        }),
    }
}

fn fallback_suggestions(role: Role) -> Vec<String> {
    templates_for_role(role)
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|t| t.name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::models::query::AiQueryRow;
    use crate::query::history::HistoryError;

    // ── Fakes ───────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedModel {
        sql: Mutex<VecDeque<Result<GeneratedQuery, ModelError>>>,
        retry_hints: Mutex<Vec<Option<(String, String)>>>,
        insights: Option<String>,
        general_answer: Option<String>,
        suggestions: Vec<String>,
        general_calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn with_sql(script: Vec<Result<GeneratedQuery, ModelError>>) -> Self {
            Self {
                sql: Mutex::new(script.into()),
                insights: Some("- Most students applied to 2 jobs".to_string()),
                ..Default::default()
            }
        }

        fn sql_calls(&self) -> usize {
            self.retry_hints.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueryModel for ScriptedModel {
        async fn generate_sql(
            &self,
            request: SqlRequest<'_>,
        ) -> Result<GeneratedQuery, ModelError> {
            self.retry_hints.lock().unwrap().push(
                request
                    .retry
                    .map(|h| (h.previous_sql.to_string(), h.error_message.to_string())),
            );
            self.sql
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Malformed("script exhausted".into())))
        }

        async fn generate_insights(
            &self,
            _question: &str,
            _rows: &[Value],
            _chart_type: ChartType,
        ) -> Result<String, ModelError> {
            self.insights
                .clone()
                .ok_or_else(|| ModelError::Unavailable("insights down".into()))
        }

        async fn generate_general_response(
            &self,
            _question: &str,
            _role: Role,
        ) -> Result<String, ModelError> {
            self.general_calls.fetch_add(1, Ordering::SeqCst);
            self.general_answer
                .clone()
                .ok_or_else(|| ModelError::Unavailable("general down".into()))
        }

        async fn generate_suggestions(
            &self,
            _role: Role,
            _recent_queries: &[String],
        ) -> Result<Vec<String>, ModelError> {
            Ok(self.suggestions.clone())
        }
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        results: Mutex<VecDeque<Result<Vec<Value>, DbError>>>,
        executed: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedExecutor {
        fn with(results: Vec<Result<Vec<Value>, DbError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                ..Default::default()
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str) -> Result<Vec<Value>, DbError> {
            self.executed.lock().unwrap().push(sql.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct MemoryHistory {
        records: Mutex<Vec<NewQueryRecord>>,
        fail: bool,
    }

    impl MemoryHistory {
        fn records(&self) -> Vec<NewQueryRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryHistory for MemoryHistory {
        async fn record(&self, record: NewQueryRecord) -> Result<Uuid, HistoryError> {
            if self.fail {
                return Err(HistoryError(sqlx::Error::PoolClosed));
            }
            self.records.lock().unwrap().push(record);
            Ok(Uuid::new_v4())
        }

        async fn list(&self, _user_id: &str, _limit: i64) -> Result<Vec<AiQueryRow>, HistoryError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _user_id: &str, _id: Uuid) -> Result<bool, HistoryError> {
            Ok(false)
        }

        async fn clear(&self, _user_id: &str) -> Result<u64, HistoryError> {
            Ok(0)
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    fn generated(sql: &str) -> Result<GeneratedQuery, ModelError> {
        Ok(GeneratedQuery {
            sql: sql.to_string(),
            explanation: "Lists the requested rows".to_string(),
            chart_type: Some("bar".to_string()),
            visualization: Some(json!({ "xAxis": "status" })),
        })
    }

    fn undefined_column() -> Result<Vec<Value>, DbError> {
        Err(DbError::new(
            Some("42703"),
            "column s.nme does not exist",
        ))
    }

    fn orchestrator(
        model: &Arc<ScriptedModel>,
        executor: &Arc<ScriptedExecutor>,
        history: &Arc<MemoryHistory>,
    ) -> QueryOrchestrator {
        QueryOrchestrator::new(
            model.clone(),
            executor.clone(),
            history.clone(),
            OrchestratorSettings::default(),
        )
    }

    fn student() -> CallerContext {
        CallerContext::student("u1", Some("s1".to_string()))
    }

    fn ask(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            template_id: None,
        }
    }

    fn use_template(id: &str) -> QueryRequest {
        QueryRequest {
            query: String::new(),
            template_id: Some(id.to_string()),
        }
    }

    // ── Tests ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_greeting_skips_generation() {
        let model = Arc::new(ScriptedModel::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("hi"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.insights.unwrap().starts_with("Hi!"));
        assert_eq!(model.sql_calls(), 0);
        assert!(executor.executed().is_empty());
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_recoverable_error_retries_once_and_persists_corrected_sql() {
        let model = Arc::new(ScriptedModel::with_sql(vec![
            generated("SELECT s.nme FROM students s"),
            generated("SELECT s.name FROM students s"),
        ]));
        let executor = Arc::new(ScriptedExecutor::with(vec![
            undefined_column(),
            Ok(vec![json!({ "name": "Asha" })]),
        ]));
        let history = Arc::new(MemoryHistory::default());

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("what is my name on record?"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.data.unwrap(), vec![json!({ "name": "Asha" })]);
        assert!(result.query_id.is_some());
        assert_eq!(result.chart_type, Some(ChartType::Bar));

        let hints = model.retry_hints.lock().unwrap().clone();
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0], None);
        assert_eq!(
            hints[1],
            Some((
                "SELECT s.nme FROM students s".to_string(),
                "column s.nme does not exist".to_string()
            ))
        );

        let records = history.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_template);
        assert!(records[0].generated_sql.contains("s.name"));
        assert!(records[0].generated_sql.contains("s.user_id = 'u1'"));
        assert_eq!(records[0].query, "what is my name on record?");
    }

    #[tokio::test]
    async fn test_validation_rejection_is_not_retried() {
        let model = Arc::new(ScriptedModel::with_sql(vec![
            generated("DELETE FROM jobs"),
            generated("SELECT j.title FROM jobs j"),
        ]));
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("remove every job posting"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::Validation(_)));
        assert_eq!(failure.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(model.sql_calls(), 1);
        assert!(executor.executed().is_empty());
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_denied_table_is_rejected_before_execution() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT j.title, acct.provider_id FROM jobs j JOIN account acct ON acct.user_id = j.id",
        )]));
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("jobs with their login accounts"))
            .await
            .unwrap_err();

        assert!(matches!(
            failure.kind,
            QueryError::Validation(SqlValidationError::TableDenied(ref t)) if t == "account"
        ));
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_second_recoverable_error_fails() {
        let model = Arc::new(ScriptedModel::with_sql(vec![
            generated("SELECT s.nme FROM students s"),
            generated("SELECT s.nmee FROM students s"),
        ]));
        let executor = Arc::new(ScriptedExecutor::with(vec![
            undefined_column(),
            undefined_column(),
        ]));
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("what is my name on record?"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::Execution(_)));
        assert_eq!(failure.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(model.sql_calls(), 2);
        assert_eq!(executor.executed().len(), 2);
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_non_recoverable_error_is_not_retried() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT j.title FROM jobs j",
        )]));
        let executor = Arc::new(ScriptedExecutor::with(vec![Err(DbError::new(
            Some("42501"),
            "permission denied for table jobs",
        ))]));
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::Execution(_)));
        assert_eq!(model.sql_calls(), 1);
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_query_times_out() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT j.title FROM jobs j",
        )]));
        let executor = Arc::new(ScriptedExecutor {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::Timeout));
        assert_eq!(failure.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(model.sql_calls(), 1);
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_statement_timeout_is_not_retried() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT j.title FROM jobs j",
        )]));
        let executor = Arc::new(ScriptedExecutor::with(vec![Err(DbError::new(
            Some("57014"),
            "canceling statement due to statement timeout",
        ))]));
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::Timeout));
        assert_eq!(model.sql_calls(), 1);
    }

    #[tokio::test]
    async fn test_quota_error_surfaces_retry_after() {
        let model = Arc::new(ScriptedModel::with_sql(vec![Err(
            ModelError::QuotaExceeded {
                retry_after: Some("30".to_string()),
            },
        )]));
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap_err();

        assert_eq!(failure.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let result = failure.into_result(Role::Student);
        assert_eq!(result.is_quota_error, Some(true));
        assert_eq!(result.retry_after.as_deref(), Some("30"));
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let model = Arc::new(ScriptedModel::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &use_template("no-such-template"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::TemplateNotFound));
        assert_eq!(failure.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            failure.into_result(Role::Student).error.as_deref(),
            Some("Template not found")
        );
    }

    #[tokio::test]
    async fn test_template_of_other_role_is_refused() {
        let model = Arc::new(ScriptedModel::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &use_template("company-application-stats"))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::TemplateRoleMismatch));
        assert_eq!(failure.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(model.sql_calls(), 0);
    }

    #[tokio::test]
    async fn test_template_fixes_chart_type_and_is_recorded() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT COUNT(s.id) AS value FROM students s",
        )]));
        let executor = Arc::new(ScriptedExecutor::with(vec![Ok(vec![json!({ "value": 120 })])]));
        let history = Arc::new(MemoryHistory::default());

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &use_template("student-cgpa-compare"))
            .await
            .unwrap();

        assert_eq!(result.chart_type, Some(ChartType::Metric));
        let records = history.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_template);
        assert_eq!(records[0].chart_type, ChartType::Metric);
        assert_eq!(records[0].query, "How does my CGPA compare?");
    }

    #[tokio::test]
    async fn test_sql_without_permitted_table_routes_to_general_answer() {
        let model = Arc::new(ScriptedModel {
            general_answer: Some("Placement season usually starts in August.".to_string()),
            ..ScriptedModel::with_sql(vec![generated("")])
        });
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("when does placement season usually start?"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.insights.as_deref(),
            Some("Placement season usually starts in August.")
        );
        assert_eq!(model.general_calls.load(Ordering::SeqCst), 1);
        assert!(executor.executed().is_empty());
        assert!(history.records().is_empty());
    }

    #[tokio::test]
    async fn test_student_filter_reaches_executed_sql() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT a.status, COUNT(a.id) AS total FROM applications a GROUP BY a.status;",
        )]));
        let executor = Arc::new(ScriptedExecutor::with(vec![Ok(vec![
            json!({ "status": "pending", "total": 2 }),
        ])]));
        let history = Arc::new(MemoryHistory::default());

        orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("how many of my applications are in each status?"))
            .await
            .unwrap();

        let executed = executor.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("a.student_id = 's1'"));
        assert!(!executed[0].contains(';'));
    }

    #[tokio::test]
    async fn test_missing_profile_fails_closed() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated(
            "SELECT a.status FROM applications a",
        )]));
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(
                &CallerContext::student("u1", None),
                &ask("show the status of my applications"),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(failure.user_message(), PROFILE_INCOMPLETE);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_insights_failure_falls_back() {
        let model = Arc::new(ScriptedModel {
            insights: None,
            ..ScriptedModel::with_sql(vec![generated("SELECT j.title FROM jobs j")])
        });
        let executor = Arc::new(ScriptedExecutor::with(vec![Ok(vec![json!({ "title": "SDE" })])]));
        let history = Arc::new(MemoryHistory::default());

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap();

        assert_eq!(result.insights.as_deref(), Some(INSIGHTS_FALLBACK));
    }

    #[tokio::test]
    async fn test_history_failure_still_returns_rows() {
        let model = Arc::new(ScriptedModel::with_sql(vec![generated("SELECT j.title FROM jobs j")]));
        let executor = Arc::new(ScriptedExecutor::with(vec![Ok(vec![json!({ "title": "SDE" })])]));
        let history = Arc::new(MemoryHistory {
            fail: true,
            ..Default::default()
        });

        let result = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("list open job titles"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.query_id.is_none());
    }

    #[tokio::test]
    async fn test_empty_query_without_template() {
        let model = Arc::new(ScriptedModel::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let failure = orchestrator(&model, &executor, &history)
            .execute(&student(), &ask("   "))
            .await
            .unwrap_err();

        assert!(matches!(failure.kind, QueryError::EmptyQuery));
        assert_eq!(failure.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_only_admin_sees_sql_and_database_message() {
        let failure = || {
            QueryFailure::new(
                QueryError::Execution(DbError::new(Some("XX000"), "internal error in planner")),
                Some("SELECT j.title FROM jobs j".to_string()),
            )
        };

        let student = failure().into_result(Role::Student);
        assert_eq!(student.sql, None);
        assert_eq!(student.error.as_deref(), Some(EXECUTION_FAILED));

        let admin = failure().into_result(Role::Admin);
        assert_eq!(admin.sql.as_deref(), Some("SELECT j.title FROM jobs j"));
        assert!(admin.error.unwrap().contains("internal error in planner"));
    }

    #[tokio::test]
    async fn test_suggestions_fall_back_to_templates() {
        let model = Arc::new(ScriptedModel::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let suggestions = orchestrator(&model, &executor, &history)
            .suggestions(&student())
            .await;

        assert!(!suggestions.is_empty());
        assert!(suggestions.len() <= MAX_SUGGESTIONS);
        assert!(suggestions.contains(&"How does my CGPA compare?".to_string()));
    }

    #[tokio::test]
    async fn test_suggestions_from_model() {
        let model = Arc::new(ScriptedModel {
            suggestions: vec!["Which companies hire the most CSE students?".to_string()],
            ..Default::default()
        });
        let executor = Arc::new(ScriptedExecutor::default());
        let history = Arc::new(MemoryHistory::default());

        let suggestions = orchestrator(&model, &executor, &history)
            .suggestions(&student())
            .await;

        assert_eq!(
            suggestions,
            vec!["Which companies hire the most CSE students?".to_string()]
        );
    }
}
