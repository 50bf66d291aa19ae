use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::access::policy::Role;
use crate::models::query::{AiQueryRow, ChartType};

/// Upper bound for a single history page.
pub const MAX_HISTORY_LIMIT: i64 = 100;
pub const DEFAULT_HISTORY_LIMIT: i64 = 10;

#[derive(Debug, Error)]
#[error("Query history error: {0}")]
pub struct HistoryError(#[from] pub sqlx::Error);

/// A successfully executed query, ready to be stored. `generated_sql` is the
/// SQL that actually ran (after retry and row filtering).
#[derive(Debug, Clone)]
pub struct NewQueryRecord {
    pub user_id: String,
    pub role: Role,
    pub query: String,
    pub generated_sql: String,
    pub results: Value,
    pub insights: Option<String>,
    pub chart_type: ChartType,
    pub is_template: bool,
    pub execution_time_ms: i32,
}

/// Append-only store of executed queries. Every read and delete is scoped to
/// the owning user.
#[async_trait]
pub trait QueryHistory: Send + Sync {
    async fn record(&self, record: NewQueryRecord) -> Result<Uuid, HistoryError>;

    /// Most recent first.
    async fn list(&self, user_id: &str, limit: i64) -> Result<Vec<AiQueryRow>, HistoryError>;

    /// Returns false when the record does not exist or belongs to someone else.
    async fn delete(&self, user_id: &str, id: Uuid) -> Result<bool, HistoryError>;

    async fn clear(&self, user_id: &str) -> Result<u64, HistoryError>;
}

pub struct PgQueryHistory {
    pool: PgPool,
}

impl PgQueryHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryHistory for PgQueryHistory {
    async fn record(&self, record: NewQueryRecord) -> Result<Uuid, HistoryError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ai_queries
                (id, user_id, role, query, generated_sql, results, insights,
                 chart_type, is_template, execution_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(&record.user_id)
        .bind(record.role.as_str())
        .bind(&record.query)
        .bind(&record.generated_sql)
        .bind(&record.results)
        .bind(&record.insights)
        .bind(record.chart_type.as_str())
        .bind(record.is_template)
        .bind(record.execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list(&self, user_id: &str, limit: i64) -> Result<Vec<AiQueryRow>, HistoryError> {
        Ok(sqlx::query_as::<_, AiQueryRow>(
            r#"
            SELECT id, user_id, role, query, generated_sql, results, insights,
                   chart_type, is_template, execution_time_ms, created_at
            FROM ai_queries
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(clamp_limit(Some(limit)))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete(&self, user_id: &str, id: Uuid) -> Result<bool, HistoryError> {
        let result = sqlx::query("DELETE FROM ai_queries WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, user_id: &str) -> Result<u64, HistoryError> {
        let result = sqlx::query("DELETE FROM ai_queries WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Missing or non-positive limits fall back to the default; large ones are capped.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(n) if n > 0 => n.min(MAX_HISTORY_LIMIT),
        _ => DEFAULT_HISTORY_LIMIT,
    }
}
