//! Database collaborator: runs validated, filtered SQL and returns rows as JSON.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

/// SQLSTATE codes that usually mean the model wrote bad SQL and deserves one
/// corrective attempt.
pub const RECOVERABLE_SQLSTATES: &[&str] = &[
    "42601", // syntax_error
    "42703", // undefined_column
    "42P01", // undefined_table
    "42P02", // undefined_parameter
    "42803", // grouping_error
    "42883", // undefined_function
    "21000", // cardinality_violation
    "22012", // division_by_zero
];

const RECOVERABLE_MESSAGES: &[&str] = &[
    "syntax error",
    "must appear in the group by",
    "does not exist",
    "undefined column",
    "undefined table",
    "undefined function",
    "more than one row returned",
    "division by zero",
];

const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DbError {
    /// SQLSTATE, when the failure came from the server.
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        if let Some(code) = &self.code {
            if RECOVERABLE_SQLSTATES.contains(&code.as_str()) {
                return true;
            }
        }
        let message = self.message.to_lowercase();
        RECOVERABLE_MESSAGES.iter().any(|m| message.contains(m))
    }

    /// The server cancelled the statement (statement_timeout).
    pub fn is_statement_timeout(&self) -> bool {
        self.code.as_deref() == Some(QUERY_CANCELED)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => Self::new(db.code().as_deref(), db.message()),
            _ => Self::new(None, err.to_string()),
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>, DbError>;
}

/// Runs each query in its own read-only transaction that is always rolled
/// back, with a server-side statement timeout.
pub struct PgQueryExecutor {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(&self, sql: &str) -> Result<Vec<Value>, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let wrapped = wrap_as_json(sql);
        let result: Result<Value, sqlx::Error> =
            sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await;

        if let Err(e) = tx.rollback().await {
            debug!("Rollback after analytics query failed: {e}");
        }

        match result? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }
}

/// Aggregates the query's rows into a single JSON array. Postgres feeds an
/// ordered subquery into json_agg in order, which keeps ORDER BY results intact.
fn wrap_as_json(sql: &str) -> String {
    format!("SELECT COALESCE(json_agg(row_to_json(q)), '[]'::json) FROM ({sql}) AS q")
}
