//! JobTracker implements C1's operations over `AsyncJobTracking` rows.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{AsyncJobTracking, AsyncStatus, ExternalStatus};

/// Aggregate outcome of a correlation group once every member is terminal
/// (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    Success,
    PartialFailure,
}

pub struct JobTracker {
    db: PgPool,
}

impl JobTracker {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Idempotent on `(correlation_id, operation_type, parent_job_id)` if a
    /// non-terminal row already exists (spec §4.1).
    pub async fn start_tracking(
        &self,
        operation_type: &str,
        correlation_id: &str,
        parent_job_id: Option<Uuid>,
    ) -> Result<Uuid> {
        if let Some(existing) = AsyncJobTracking::find_active_by_key(
            correlation_id,
            operation_type,
            parent_job_id,
            &self.db,
        )
        .await?
        {
            return Ok(existing.id);
        }

        let builder = AsyncJobTracking::builder()
            .correlation_id(correlation_id)
            .operation_type(operation_type);
        let job = match parent_job_id {
            Some(parent) => builder.parent_job_id(parent).build(),
            None => builder.build(),
        };

        let job = job.insert(&self.db).await?;
        Ok(job.id)
    }

    pub async fn record_submission(&self, job_id: Uuid, external_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE async_job_tracking
            SET external_job_id = $1, status = 'polling'
            WHERE id = $2
            "#,
        )
        .bind(external_id)
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Rejects transitions out of a terminal state with a distinguishable
    /// error (spec §4.1).
    pub async fn update_status(
        &self,
        job_id: Uuid,
        internal_status: AsyncStatus,
        external_status: ExternalStatus,
        response: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::Validation(format!("unknown job {job_id}")))?;

        if job.status.is_terminal() && internal_status != job.status {
            return Err(AppError::Validation(format!(
                "cannot transition job {job_id} out of terminal status {:?}",
                job.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE async_job_tracking
            SET status = $1, external_status = $2, response_payload = $3, error_message = $4
            WHERE id = $5
            "#,
        )
        .bind(internal_status)
        .bind(external_status)
        .bind(response)
        .bind(error)
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn schedule_poll(
        &self,
        job_id: Uuid,
        retries: i32,
        next_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE async_job_tracking
            SET retry_count = $1, next_poll_at = $2
            WHERE id = $3
            "#,
        )
        .bind(retries)
        .bind(next_at)
        .bind(job_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn increment_retry(&self, job_id: Uuid) -> Result<i32> {
        let new_count: i32 = sqlx::query_scalar(
            r#"
            UPDATE async_job_tracking
            SET retry_count = retry_count + 1
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.db)
        .await?;

        Ok(new_count)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<AsyncJobTracking>> {
        AsyncJobTracking::find_by_id(job_id, &self.db).await
    }

    pub async fn get_jobs_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<AsyncJobTracking>> {
        AsyncJobTracking::find_by_correlation_id(correlation_id, &self.db).await
    }

    pub async fn get_jobs_due_for_polling(&self, limit: i64) -> Result<Vec<AsyncJobTracking>> {
        AsyncJobTracking::due_for_polling(limit, &self.db).await
    }

    /// `ShouldRetry` (spec §4.1): retry budget remains, external status is
    /// still in-flight, and the backoff window since the last update has
    /// elapsed.
    pub fn should_retry(&self, job: &AsyncJobTracking, backoff_window: ChronoDuration) -> bool {
        let elapsed = Utc::now() - job.initiated_at >= backoff_window;
        job.should_retry(elapsed)
    }

    /// Inspect a correlation group: `None` while any sibling is still
    /// non-terminal, `Some(outcome)` exactly once all are terminal
    /// (spec §4.1, §8 correlation-completion property).
    ///
    /// Callers are responsible for firing the signal at most once per
    /// group; see `async_poller` for the consumer that does this under a
    /// DB-transaction guard.
    pub async fn inspect_correlation_group(
        &self,
        correlation_id: &str,
    ) -> Result<Option<CorrelationOutcome>> {
        let members = self.get_jobs_by_correlation_id(correlation_id).await?;
        if members.is_empty() || !members.iter().all(|m| m.status.is_terminal()) {
            return Ok(None);
        }

        let all_succeeded = members.iter().all(|m| m.status == AsyncStatus::Completed);
        let outcome = if all_succeeded {
            CorrelationOutcome::Success
        } else {
            CorrelationOutcome::PartialFailure
        };

        info!(correlation_id, ?outcome, "correlation group complete");
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AsyncStatus;

    fn pool_unused() -> PgPool {
        // These tests exercise only pure, non-DB logic paths; a lazily
        // connected pool is never awaited.
        PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap()
    }

    #[tokio::test]
    async fn should_retry_pure_logic_respects_terminal_external_status() {
        let tracker = JobTracker::new(pool_unused());
        let mut job = AsyncJobTracking::builder()
            .correlation_id("corr-1")
            .operation_type("attach_volume")
            .build();
        job.external_status = ExternalStatus::Success;
        job.initiated_at = Utc::now() - ChronoDuration::minutes(10);
        assert!(!tracker.should_retry(&job, ChronoDuration::seconds(1)));
    }

    #[tokio::test]
    async fn should_retry_true_once_backoff_elapsed_and_budget_remains() {
        let tracker = JobTracker::new(pool_unused());
        let mut job = AsyncJobTracking::builder()
            .correlation_id("corr-1")
            .operation_type("attach_volume")
            .build();
        job.initiated_at = Utc::now() - ChronoDuration::minutes(10);
        assert!(tracker.should_retry(&job, ChronoDuration::seconds(1)));
    }

    #[test]
    fn correlation_outcome_equality() {
        assert_eq!(CorrelationOutcome::Success, CorrelationOutcome::Success);
        assert_ne!(CorrelationOutcome::Success, CorrelationOutcome::PartialFailure);
    }

    #[test]
    fn default_async_job_is_pending_and_not_terminal() {
        let job = AsyncJobTracking::builder()
            .correlation_id("corr-2")
            .operation_type("create_volume")
            .build();
        assert_eq!(job.status, AsyncStatus::Pending);
        assert!(!job.status.is_terminal());
    }
}
