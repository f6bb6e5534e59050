//! VMContext - the master record per protected VM (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "vm_status", rename_all = "snake_case")]
pub enum VmStatus {
    #[default]
    Discovered,
    ReadyForReplication,
    Replicating,
    ReadyForFailover,
    FailedOverTest,
    FailedOverLive,
    CleanupRequired,
    Disabled,
}

impl VmStatus {
    /// Invariant (spec §3): `current_job_id` is non-null iff status is one
    /// of these "has an active job" states.
    pub fn requires_active_job(&self) -> bool {
        matches!(
            self,
            VmStatus::Replicating | VmStatus::CleanupRequired
        )
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct VmContext {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub context_id: String,
    pub vm_name: String,
    pub platform_vm_id: String,
    #[builder(default, setter(strip_option))]
    pub platform_host: Option<String>,
    #[builder(default, setter(strip_option))]
    pub datacenter: Option<String>,
    #[builder(default)]
    pub current_status: VmStatus,
    #[builder(default, setter(strip_option))]
    pub current_job_id: Option<Uuid>,
    #[builder(default = true)]
    pub scheduler_enabled: bool,
    #[builder(default = 0)]
    pub successful_jobs: i32,
    #[builder(default = 0)]
    pub failed_jobs: i32,
    #[builder(default, setter(strip_option))]
    pub target_platform_config_id: Option<Uuid>,
    #[builder(default = false)]
    pub auto_added: bool,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl VmContext {
    /// Enforce the VMContext invariant before a write: `current_job_id` is
    /// set iff `current_status` is one of the active-job statuses.
    pub fn validate_invariant(&self) -> Result<()> {
        let has_job = self.current_job_id.is_some();
        let needs_job = self.current_status.requires_active_job();
        if has_job != needs_job {
            return Err(AppError::Internal(format!(
                "VMContext {} invariant violated: status={:?} current_job_id={:?}",
                self.context_id, self.current_status, self.current_job_id
            )));
        }
        Ok(())
    }

    pub async fn find_by_context_id(context_id: &str, db: &PgPool) -> Result<Option<Self>> {
        let ctx = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, context_id, vm_name, platform_vm_id, platform_host, datacenter,
                   current_status, current_job_id, scheduler_enabled, successful_jobs,
                   failed_jobs, target_platform_config_id, auto_added, created_at, updated_at
            FROM vm_contexts
            WHERE context_id = $1
            "#,
        )
        .bind(context_id)
        .fetch_optional(db)
        .await?;

        Ok(ctx)
    }

    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let ctx = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, context_id, vm_name, platform_vm_id, platform_host, datacenter,
                   current_status, current_job_id, scheduler_enabled, successful_jobs,
                   failed_jobs, target_platform_config_id, auto_added, created_at, updated_at
            FROM vm_contexts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(ctx)
    }

    pub async fn find_by_current_job_id(job_id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let ctx = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, context_id, vm_name, platform_vm_id, platform_host, datacenter,
                   current_status, current_job_id, scheduler_enabled, successful_jobs,
                   failed_jobs, target_platform_config_id, auto_added, created_at, updated_at
            FROM vm_contexts
            WHERE current_job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;

        Ok(ctx)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let ctx = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO vm_contexts (
                id, context_id, vm_name, platform_vm_id, platform_host, datacenter,
                current_status, current_job_id, scheduler_enabled, successful_jobs,
                failed_jobs, target_platform_config_id, auto_added, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id, context_id, vm_name, platform_vm_id, platform_host, datacenter,
                      current_status, current_job_id, scheduler_enabled, successful_jobs,
                      failed_jobs, target_platform_config_id, auto_added, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.context_id)
        .bind(&self.vm_name)
        .bind(&self.platform_vm_id)
        .bind(&self.platform_host)
        .bind(&self.datacenter)
        .bind(self.current_status)
        .bind(self.current_job_id)
        .bind(self.scheduler_enabled)
        .bind(self.successful_jobs)
        .bind(self.failed_jobs)
        .bind(self.target_platform_config_id)
        .bind(self.auto_added)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(ctx)
    }

    /// Transition into an active-job state, assigning the new job.
    /// Must run in the same transaction as the job's creation to avoid a
    /// reader observing an inconsistent pair (spec §5).
    pub async fn attach_job(
        &self,
        job_id: Uuid,
        new_status: VmStatus,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE vm_contexts
            SET current_job_id = $1, current_status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(job_id)
        .bind(new_status)
        .bind(self.id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Terminalize the active job: clear `current_job_id`, move to
    /// `ready_for_failover`, and bump the success/failure counter.
    pub async fn finish_job(
        &self,
        succeeded: bool,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<()> {
        let counter_column = if succeeded {
            "successful_jobs"
        } else {
            "failed_jobs"
        };

        sqlx::query(&format!(
            r#"
            UPDATE vm_contexts
            SET current_job_id = NULL,
                current_status = 'ready_for_failover',
                {counter_column} = {counter_column} + 1,
                updated_at = NOW()
            WHERE id = $1
            "#
        ))
        .bind(self.id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmContext {
        VmContext::builder()
            .context_id("ctx-a")
            .vm_name("vm-a")
            .platform_vm_id("vm-123")
            .build()
    }

    #[test]
    fn new_context_is_discovered() {
        let ctx = sample();
        assert_eq!(ctx.current_status, VmStatus::Discovered);
        assert!(ctx.current_job_id.is_none());
    }

    #[test]
    fn invariant_holds_for_discovered_without_job() {
        let ctx = sample();
        assert!(ctx.validate_invariant().is_ok());
    }

    #[test]
    fn invariant_violated_for_replicating_without_job() {
        let mut ctx = sample();
        ctx.current_status = VmStatus::Replicating;
        assert!(ctx.validate_invariant().is_err());
    }

    #[test]
    fn invariant_violated_for_discovered_with_job() {
        let mut ctx = sample();
        ctx.current_job_id = Some(Uuid::new_v4());
        assert!(ctx.validate_invariant().is_err());
    }

    #[test]
    fn invariant_holds_for_replicating_with_job() {
        let mut ctx = sample();
        ctx.current_status = VmStatus::Replicating;
        ctx.current_job_id = Some(Uuid::new_v4());
        assert!(ctx.validate_invariant().is_ok());
    }
}
