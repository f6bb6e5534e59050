//! LogEntry - structured record emitted by the Structured Logger (spec §3, C9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub operation: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl LogEntry {
    /// Insert into the per-job execution-log table (sink (b), spec §4.9).
    /// Failures here must not break the operation path, so callers should
    /// log-and-swallow the returned error.
    pub async fn insert_job_log(&self, db: &PgPool) -> crate::error::Result<()> {
        let Some(job_id) = self.job_id else {
            return Ok(());
        };

        sqlx::query(
            r#"
            INSERT INTO job_execution_log (
                id, job_id, timestamp, level, component, operation, message,
                correlation_id, context, error, duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(self.id)
        .bind(job_id)
        .bind(self.timestamp)
        .bind(serde_json::to_string(&self.level).unwrap_or_default())
        .bind(&self.component)
        .bind(&self.operation)
        .bind(&self.message)
        .bind(&self.correlation_id)
        .bind(&self.context)
        .bind(self.error.as_ref().map(|e| serde_json::to_value(e).unwrap_or_default()))
        .bind(self.duration_ms)
        .execute(db)
        .await?;

        Ok(())
    }
}
