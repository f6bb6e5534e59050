//! AsyncJobTracking - record of an operation submitted to the external IaaS
//! (spec §3, C1 Job Tracker).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "async_status", rename_all = "snake_case")]
pub enum AsyncStatus {
    #[default]
    Pending,
    Polling,
    Completed,
    Failed,
}

impl AsyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncStatus::Completed | AsyncStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "external_status", rename_all = "snake_case")]
pub enum ExternalStatus {
    #[default]
    Unknown,
    Pending,
    InProgress,
    Success,
    Failure,
}

impl ExternalStatus {
    /// Maps the IaaS's numeric job_status code (spec §4.2/§6).
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExternalStatus::Pending,
            1 => ExternalStatus::InProgress,
            2 => ExternalStatus::Success,
            3 => ExternalStatus::Failure,
            _ => ExternalStatus::Unknown,
        }
    }

    pub fn is_still_running(&self) -> bool {
        matches!(
            self,
            ExternalStatus::Unknown | ExternalStatus::Pending | ExternalStatus::InProgress
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AsyncJobTracking {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub correlation_id: String,
    #[builder(default, setter(strip_option))]
    pub parent_job_id: Option<Uuid>,
    pub operation_type: String,
    #[builder(default, setter(strip_option))]
    pub external_job_id: Option<String>,
    #[builder(default)]
    pub status: AsyncStatus,
    #[builder(default)]
    pub external_status: ExternalStatus,
    #[builder(default, setter(strip_option))]
    pub response_payload: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 5)]
    pub max_retries: i32,
    #[builder(default = Utc::now())]
    pub initiated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub next_poll_at: Option<DateTime<Utc>>,
}

impl AsyncJobTracking {
    /// spec §4.1: retry/backoff-window gate for the poller.
    pub fn should_retry(&self, backoff_window_elapsed: bool) -> bool {
        self.retry_count < self.max_retries
            && self.external_status.is_still_running()
            && backoff_window_elapsed
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> crate::error::Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                   external_status, response_payload, error_message, retry_count, max_retries,
                   initiated_at, next_poll_at
            FROM async_job_tracking
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    pub async fn find_by_correlation_id(
        correlation_id: &str,
        db: &PgPool,
    ) -> crate::error::Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                   external_status, response_payload, error_message, retry_count, max_retries,
                   initiated_at, next_poll_at
            FROM async_job_tracking
            WHERE correlation_id = $1
            ORDER BY initiated_at
            "#,
        )
        .bind(correlation_id)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    /// Non-terminal row for this `(correlation_id, operation_type,
    /// parent_job_id)` triple, used by `StartTracking`'s idempotence check
    /// (spec §4.1).
    pub async fn find_active_by_key(
        correlation_id: &str,
        operation_type: &str,
        parent_job_id: Option<Uuid>,
        db: &PgPool,
    ) -> crate::error::Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                   external_status, response_payload, error_message, retry_count, max_retries,
                   initiated_at, next_poll_at
            FROM async_job_tracking
            WHERE correlation_id = $1 AND operation_type = $2
              AND parent_job_id IS NOT DISTINCT FROM $3
              AND status != 'completed' AND status != 'failed'
            LIMIT 1
            "#,
        )
        .bind(correlation_id)
        .bind(operation_type)
        .bind(parent_job_id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    pub async fn insert(&self, db: &PgPool) -> crate::error::Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO async_job_tracking (
                id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                external_status, response_payload, error_message, retry_count, max_retries,
                initiated_at, next_poll_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                      external_status, response_payload, error_message, retry_count, max_retries,
                      initiated_at, next_poll_at
            "#,
        )
        .bind(self.id)
        .bind(&self.correlation_id)
        .bind(self.parent_job_id)
        .bind(&self.operation_type)
        .bind(&self.external_job_id)
        .bind(self.status)
        .bind(self.external_status)
        .bind(&self.response_payload)
        .bind(&self.error_message)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(self.initiated_at)
        .bind(self.next_poll_at)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    pub async fn due_for_polling(limit: i64, db: &PgPool) -> crate::error::Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, correlation_id, parent_job_id, operation_type, external_job_id, status,
                   external_status, response_payload, error_message, retry_count, max_retries,
                   initiated_at, next_poll_at
            FROM async_job_tracking
            WHERE status = 'polling' AND next_poll_at <= NOW()
            ORDER BY next_poll_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_iaas_status_codes() {
        assert_eq!(ExternalStatus::from_code(0), ExternalStatus::Pending);
        assert_eq!(ExternalStatus::from_code(1), ExternalStatus::InProgress);
        assert_eq!(ExternalStatus::from_code(2), ExternalStatus::Success);
        assert_eq!(ExternalStatus::from_code(3), ExternalStatus::Failure);
        assert_eq!(ExternalStatus::from_code(99), ExternalStatus::Unknown);
    }

    #[test]
    fn should_retry_respects_retry_budget() {
        let mut job = AsyncJobTracking::builder()
            .correlation_id("corr-1")
            .operation_type("attach_volume")
            .build();
        job.retry_count = 5;
        job.max_retries = 5;
        assert!(!job.should_retry(true));
    }

    #[test]
    fn should_retry_respects_backoff_window() {
        let job = AsyncJobTracking::builder()
            .correlation_id("corr-1")
            .operation_type("attach_volume")
            .build();
        assert!(!job.should_retry(false));
        assert!(job.should_retry(true));
    }

    #[test]
    fn should_not_retry_once_external_status_terminal() {
        let mut job = AsyncJobTracking::builder()
            .correlation_id("corr-1")
            .operation_type("attach_volume")
            .build();
        job.external_status = ExternalStatus::Success;
        assert!(!job.should_retry(true));
    }
}
