use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// How the frontend should render a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Radar,
    #[default]
    Table,
    Metric,
    Funnel,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
            ChartType::Radar => "radar",
            ChartType::Table => "table",
            ChartType::Metric => "metric",
            ChartType::Funnel => "funnel",
        }
    }

    /// Model output is free text; anything unrecognised renders as a table.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "bar" => ChartType::Bar,
            "line" => ChartType::Line,
            "pie" => ChartType::Pie,
            "radar" => ChartType::Radar,
            "metric" => ChartType::Metric,
            "funnel" => ChartType::Funnel,
            _ => ChartType::Table,
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, successfully executed analytics query.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AiQueryRow {
    pub id: Uuid,
    pub user_id: String,
    pub role: String,
    pub query: String,
    pub generated_sql: String,
    pub results: Option<Value>,
    pub insights: Option<String>,
    pub chart_type: Option<String>,
    pub is_template: bool,
    pub execution_time_ms: Option<i32>,
    pub created_at: DateTime<Utc>,
}
