//! Job Recovery (C4) — startup reconciliation of in-flight jobs against the
//! source agent, plus a periodic health monitor for mid-run orphans
//! (spec §4.4).
//!
//! Recovery is the sole writer of startup-time job-state transitions; the
//! phantom detector (C5) is advisory only (see SPEC_FULL.md §9).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::{SourceAgentClient, SourceAgentReply};
use crate::codec::MigrationVolumeKey;
use crate::kernel::service_host::Service;
use crate::models::{JobStatus, ReplicationJob, VmContext, VmDisk};

fn stagnation_threshold() -> chrono::Duration {
    chrono::Duration::minutes(30)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    RestartPolling,
    MarkCompleted,
    MarkFailed { classification: &'static str },
    LeaveUnchanged,
}

pub struct Recovery {
    db: PgPool,
    source_agent: Arc<dyn SourceAgentClient>,
}

impl Recovery {
    pub fn new(db: PgPool, source_agent: Arc<dyn SourceAgentClient>) -> Self {
        Self { db, source_agent }
    }

    /// Runs once at process start, before normal schedulers resume
    /// (spec §4.4). Safe to call more than once: running it twice on the
    /// same DB state produces the same final state.
    pub async fn run_startup_reconciliation(&self) -> AnyResult<()> {
        for status in JobStatus::active_statuses() {
            let jobs = ReplicationJob::find_by_status(*status, &self.db).await?;
            for job in jobs {
                self.reconcile_job(&job).await;
            }
        }
        Ok(())
    }

    /// Scans for mid-run orphans: jobs whose `last_poll_at` is stale yet not
    /// terminal (spec §4.4 health monitor).
    pub async fn health_monitor_tick(&self, stale_threshold: Duration) -> AnyResult<()> {
        for status in JobStatus::active_statuses() {
            let jobs = ReplicationJob::find_by_status(*status, &self.db).await?;
            for job in jobs {
                let stale = job
                    .last_polled_at
                    .map(|t| Utc::now() - t > chrono::Duration::from_std(stale_threshold).unwrap())
                    .unwrap_or(true);
                if stale {
                    self.reconcile_job(&job).await;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_job(&self, job: &ReplicationJob) {
        let action = self.decide(job).await;
        self.apply(job, action).await;
    }

    async fn decide(&self, job: &ReplicationJob) -> RecoveryAction {
        let disks = VmDisk::find_by_vm_context(job.vm_context_id, &self.db).await.unwrap_or_default();
        let mut keys: Vec<String> = disks
            .iter()
            .filter_map(|d| d.backend_volume_id.as_deref())
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| MigrationVolumeKey(id).encode())
            .collect();
        keys.push(job.id.to_string());

        let mut reply = SourceAgentReply::NotFound;
        let mut saw_unreachable = false;
        for key in &keys {
            match self.source_agent.get_progress(key).await {
                Ok(SourceAgentReply::Found(progress)) => {
                    reply = SourceAgentReply::Found(progress);
                    break;
                }
                Ok(SourceAgentReply::Unreachable) => saw_unreachable = true,
                Ok(SourceAgentReply::NotFound) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "recovery lookup error");
                    saw_unreachable = true;
                }
            }
        }
        if matches!(reply, SourceAgentReply::NotFound) && saw_unreachable {
            reply = SourceAgentReply::Unreachable;
        }

        match reply {
            SourceAgentReply::Found(progress) if progress.status == "completed" || progress.phase == "completed" => {
                RecoveryAction::MarkCompleted
            }
            SourceAgentReply::Found(progress) if progress.status == "failed" => {
                RecoveryAction::MarkFailed {
                    classification: "vma_reported_failure",
                }
            }
            SourceAgentReply::Found(_) => RecoveryAction::RestartPolling,
            SourceAgentReply::NotFound if job.progress_percent > 90 => RecoveryAction::MarkCompleted,
            SourceAgentReply::NotFound => RecoveryAction::MarkFailed {
                classification: "job_lost",
            },
            SourceAgentReply::Unreachable => {
                let stagnant = Utc::now() - job.updated_at > stagnation_threshold();
                if stagnant {
                    RecoveryAction::MarkFailed {
                        classification: "vma_unreachable_timeout",
                    }
                } else {
                    RecoveryAction::LeaveUnchanged
                }
            }
        }
    }

    async fn apply(&self, job: &ReplicationJob, action: RecoveryAction) {
        match action {
            RecoveryAction::LeaveUnchanged => {}
            RecoveryAction::RestartPolling => {
                info!(job_id = %job.id, "recovery restarting progress polling");
            }
            RecoveryAction::MarkCompleted => {
                self.terminalize(job, JobStatus::Completed, None, None).await;
            }
            RecoveryAction::MarkFailed { classification } => {
                self.terminalize(job, JobStatus::Failed, Some(classification), Some(classification.to_string()))
                    .await;
            }
        }
    }

    async fn terminalize(
        &self,
        job: &ReplicationJob,
        status: JobStatus,
        error_message: Option<&str>,
        error_classification: Option<String>,
    ) {
        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "recovery failed to open transaction");
                return;
            }
        };

        if let Err(e) = job
            .mark_terminal(status, error_message, error_classification.as_deref(), None, &mut tx)
            .await
        {
            warn!(job_id = %job.id, error = %e, "recovery failed to mark job terminal");
            return;
        }

        if let Ok(Some(ctx)) = VmContext::find_by_current_job_id(job.id, &self.db).await {
            if let Err(e) = ctx.finish_job(status == JobStatus::Completed, &mut tx).await {
                warn!(job_id = %job.id, error = %e, "recovery failed to finalize VMContext");
                return;
            }
        }

        if let Err(e) = tx.commit().await {
            warn!(job_id = %job.id, error = %e, "recovery failed to commit terminalization");
        } else {
            info!(job_id = %job.id, ?status, "recovery terminalized job");
        }
    }
}

/// Periodic re-scan for orphans that lost their in-memory polling slot
/// (spec §4.4, §5).
pub struct HealthMonitor {
    recovery: Arc<Recovery>,
    interval: Duration,
    stale_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(recovery: Arc<Recovery>, interval: Duration, stale_threshold: Duration) -> Self {
        Self {
            recovery,
            interval,
            stale_threshold,
        }
    }
}

#[async_trait]
impl Service for HealthMonitor {
    fn name(&self) -> &'static str {
        "health-monitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.recovery.health_monitor_tick(self.stale_threshold).await {
                        warn!(error = %e, "health monitor tick failed");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::source_agent::fake::FakeSourceAgentClient;

    fn pool_unused() -> PgPool {
        // `decide` swallows the disk lookup's connection error via
        // `unwrap_or_default`, so a never-connected lazy pool is enough to
        // exercise the pure decision logic below it. A short acquire
        // timeout keeps the test from blocking on sqlx's 30s default while
        // it fails to reach a nonexistent backend.
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(100))
            .connect_lazy("postgres://localhost/nonexistent")
            .unwrap()
    }

    fn job_with_progress(progress_percent: i32) -> ReplicationJob {
        let mut job = ReplicationJob::builder().vm_context_id(Uuid::new_v4()).build();
        job.progress_percent = progress_percent;
        job
    }

    #[tokio::test]
    async fn not_found_with_high_progress_completes() {
        // FakeSourceAgentClient defaults to NotFound for every unset key.
        let recovery = Recovery::new(pool_unused(), Arc::new(FakeSourceAgentClient::default()));
        let job = job_with_progress(95);
        assert_eq!(recovery.decide(&job).await, RecoveryAction::MarkCompleted);
    }

    #[tokio::test]
    async fn not_found_with_low_progress_marks_lost() {
        let recovery = Recovery::new(pool_unused(), Arc::new(FakeSourceAgentClient::default()));
        let job = job_with_progress(40);
        assert_eq!(
            recovery.decide(&job).await,
            RecoveryAction::MarkFailed {
                classification: "job_lost"
            }
        );
    }
}
