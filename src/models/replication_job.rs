//! ReplicationJob - one attempt to synchronize a VM (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Provisioning,
    Attaching,
    Configuring,
    Analyzing,
    Initializing,
    ReadyForSync,
    Replicating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The "active" set enumerated for recovery (spec §4.4).
    pub fn active_statuses() -> &'static [JobStatus] {
        &[
            JobStatus::Pending,
            JobStatus::Provisioning,
            JobStatus::Attaching,
            JobStatus::Configuring,
            JobStatus::Analyzing,
            JobStatus::Initializing,
            JobStatus::ReadyForSync,
            JobStatus::Replicating,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "replication_type", rename_all = "snake_case")]
pub enum ReplicationType {
    #[default]
    Initial,
    Incremental,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ReplicationJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub vm_context_id: Uuid,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress_percent: i32,
    #[builder(default = 0)]
    pub bytes_transferred: i64,
    #[builder(default = 0)]
    pub total_bytes: i64,
    /// Convenience, VM-level cache only. Never authoritative for
    /// incremental resume — `VmDisk::change_id` is (spec §9).
    #[builder(default, setter(strip_option))]
    pub change_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub previous_change_id: Option<String>,
    #[builder(default)]
    pub replication_type: ReplicationType,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_classification: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_details: Option<serde_json::Value>,
}

impl ReplicationJob {
    /// Terminal stickiness (spec §3/§8): once completed/failed, only
    /// `updated_at` may change.
    pub fn can_transition_to(&self, new_status: JobStatus) -> bool {
        if self.status.is_terminal() {
            return new_status == self.status;
        }
        true
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, vm_context_id, status, progress_percent, bytes_transferred, total_bytes,
                   change_id, previous_change_id, replication_type, created_at, started_at,
                   updated_at, completed_at, last_polled_at, error_message, error_classification,
                   error_details
            FROM replication_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(job)
    }

    pub async fn find_by_status(status: JobStatus, db: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, vm_context_id, status, progress_percent, bytes_transferred, total_bytes,
                   change_id, previous_change_id, replication_type, created_at, started_at,
                   updated_at, completed_at, last_polled_at, error_message, error_classification,
                   error_details
            FROM replication_jobs
            WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    pub async fn find_active(db: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, vm_context_id, status, progress_percent, bytes_transferred, total_bytes,
                   change_id, previous_change_id, replication_type, created_at, started_at,
                   updated_at, completed_at, last_polled_at, error_message, error_classification,
                   error_details
            FROM replication_jobs
            WHERE status = ANY($1)
            "#,
        )
        .bind(JobStatus::active_statuses().to_vec())
        .fetch_all(db)
        .await?;

        Ok(jobs)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO replication_jobs (
                id, vm_context_id, status, progress_percent, bytes_transferred, total_bytes,
                change_id, previous_change_id, replication_type, created_at, started_at,
                updated_at, completed_at, last_polled_at, error_message, error_classification,
                error_details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING id, vm_context_id, status, progress_percent, bytes_transferred, total_bytes,
                      change_id, previous_change_id, replication_type, created_at, started_at,
                      updated_at, completed_at, last_polled_at, error_message, error_classification,
                      error_details
            "#,
        )
        .bind(self.id)
        .bind(self.vm_context_id)
        .bind(self.status)
        .bind(self.progress_percent)
        .bind(self.bytes_transferred)
        .bind(self.total_bytes)
        .bind(&self.change_id)
        .bind(&self.previous_change_id)
        .bind(self.replication_type)
        .bind(self.created_at)
        .bind(self.started_at)
        .bind(self.updated_at)
        .bind(self.completed_at)
        .bind(self.last_polled_at)
        .bind(&self.error_message)
        .bind(&self.error_classification)
        .bind(&self.error_details)
        .fetch_one(db)
        .await?;

        Ok(job)
    }

    /// Apply a progress update. Rejects any write to a terminal job other
    /// than via `mark_terminal` (spec §3 invariant).
    pub async fn update_progress(
        &self,
        percent: i32,
        bytes_transferred: i64,
        total_bytes: i64,
        db: &PgPool,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AppError::Internal(format!(
                "job {} is terminal; rejecting progress update",
                self.id
            )));
        }

        sqlx::query(
            r#"
            UPDATE replication_jobs
            SET progress_percent = $1, bytes_transferred = $2, total_bytes = $3,
                last_polled_at = NOW(), updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(percent)
        .bind(bytes_transferred)
        .bind(total_bytes)
        .bind(self.id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Records the replication type reported by the source agent's
    /// `sync_type` field (spec §4.3 mapping).
    pub async fn set_replication_type(&self, replication_type: ReplicationType, db: &PgPool) -> Result<()> {
        if self.status.is_terminal() {
            return Ok(());
        }

        sqlx::query("UPDATE replication_jobs SET replication_type = $1, updated_at = NOW() WHERE id = $2")
            .bind(replication_type)
            .bind(self.id)
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn mark_terminal(
        &self,
        status: JobStatus,
        error_message: Option<&str>,
        error_classification: Option<&str>,
        error_details: Option<serde_json::Value>,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(AppError::Internal(format!(
                "mark_terminal called with non-terminal status {status:?}"
            )));
        }
        if self.status.is_terminal() {
            // Terminal stickiness: no-op on an already-terminal job.
            return Ok(());
        }

        let completed_at = if status == JobStatus::Completed {
            Some(Utc::now())
        } else {
            None
        };
        let progress = if status == JobStatus::Completed {
            100
        } else {
            self.progress_percent
        };

        sqlx::query(
            r#"
            UPDATE replication_jobs
            SET status = $1, progress_percent = $2, completed_at = $3,
                error_message = $4, error_classification = $5, error_details = $6,
                updated_at = NOW()
            WHERE id = $7
            "#,
        )
        .bind(status)
        .bind(progress)
        .bind(completed_at)
        .bind(error_message)
        .bind(error_classification)
        .bind(error_details)
        .bind(self.id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReplicationJob {
        ReplicationJob::builder().vm_context_id(Uuid::new_v4()).build()
    }

    #[test]
    fn new_job_is_pending_with_zero_progress() {
        let job = sample();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress_percent, 0);
    }

    #[test]
    fn terminal_stickiness_blocks_transition_out() {
        let mut job = sample();
        job.status = JobStatus::Completed;
        assert!(!job.can_transition_to(JobStatus::Replicating));
        assert!(job.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn non_terminal_job_can_transition_anywhere() {
        let job = sample();
        assert!(job.can_transition_to(JobStatus::Replicating));
        assert!(job.can_transition_to(JobStatus::Failed));
    }
}
