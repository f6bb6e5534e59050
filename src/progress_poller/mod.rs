//! Progress Poller (C3) — per-job HTTP polling of source-agent progress
//! for actively replicating jobs (spec §4.3).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::{AgentProgress, SourceAgentClient, SourceAgentReply};
use crate::codec::MigrationVolumeKey;
use crate::error::Result;
use crate::kernel::service_host::Service;
use crate::models::{JobStatus, ReplicationJob, ReplicationType, VmContext, VmDisk};

pub struct ProgressPollerConfig {
    pub poll_tick: Duration,
    pub grace_period: Duration,
    pub max_transport_errors: u32,
    pub max_concurrent_polls: usize,
}

impl Default for ProgressPollerConfig {
    fn default() -> Self {
        Self {
            poll_tick: Duration::from_secs(5),
            grace_period: Duration::from_secs(30),
            max_transport_errors: 5,
            max_concurrent_polls: 10,
        }
    }
}

struct PollState {
    started_at: DateTime<Utc>,
    consecutive_errors: u32,
}

/// Process-local record of which jobs are being progress-polled. Lost on
/// restart; Recovery (C4) reconstructs the expected active set from the DB
/// (spec §5).
pub struct ProgressPoller {
    db: PgPool,
    source_agent: Arc<dyn SourceAgentClient>,
    config: ProgressPollerConfig,
    active: Mutex<HashMap<Uuid, PollState>>,
    stop_requests: Mutex<HashSet<Uuid>>,
}

impl ProgressPoller {
    pub fn new(db: PgPool, source_agent: Arc<dyn SourceAgentClient>, config: ProgressPollerConfig) -> Self {
        Self {
            db,
            source_agent,
            config,
            active: Mutex::new(HashMap::new()),
            stop_requests: Mutex::new(HashSet::new()),
        }
    }

    /// Idempotent: repeated calls for the same job are a no-op (spec §4.3).
    pub fn stop_polling(&self, job_id: Uuid) {
        self.stop_requests.lock().unwrap().insert(job_id);
        self.active.lock().unwrap().remove(&job_id);
    }

    pub async fn tick(&self) {
        let jobs = match ReplicationJob::find_by_status(JobStatus::Replicating, &self.db).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "progress poller failed to list replicating jobs");
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_polls));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            if self.stop_requests.lock().unwrap().remove(&job.id) {
                self.active.lock().unwrap().remove(&job.id);
                continue;
            }

            let semaphore = semaphore.clone();
            let db = self.db.clone();
            let source_agent = self.source_agent.clone();
            let grace_period = self.config.grace_period;
            let started_at = {
                let mut active = self.active.lock().unwrap();
                active
                    .entry(job.id)
                    .or_insert_with(|| PollState {
                        started_at: Utc::now(),
                        consecutive_errors: 0,
                    })
                    .started_at
            };

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                poll_one(&db, source_agent.as_ref(), job, started_at, grace_period).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(PollOutcome::Continue) | Ok(PollOutcome::Terminalized) => {}
                Ok(PollOutcome::TransportError { job }) => {
                    let exhausted = {
                        let mut active = self.active.lock().unwrap();
                        match active.get_mut(&job.id) {
                            Some(state) => {
                                state.consecutive_errors += 1;
                                state.consecutive_errors >= self.config.max_transport_errors
                            }
                            None => false,
                        }
                    };
                    if exhausted {
                        self.active.lock().unwrap().remove(&job.id);
                        terminalize_failed(&self.db, &job, "vma_polling_failed", None).await;
                    }
                }
                Ok(PollOutcome::StopPolling { job_id }) => {
                    self.active.lock().unwrap().remove(&job_id);
                }
                Err(e) => warn!(error = %e, "progress poll task panicked"),
            }
        }
    }
}

enum PollOutcome {
    Continue,
    Terminalized,
    TransportError { job: Box<ReplicationJob> },
    StopPolling { job_id: Uuid },
}

/// Try the per-volume export-name key(s) first, falling back to the job id
/// (spec §4.3: "Hub must try both, preferring per-volume lookup").
fn candidate_keys(job_id: Uuid, disks: &[VmDisk]) -> Vec<String> {
    let mut keys: Vec<String> = disks
        .iter()
        .filter_map(|d| d.backend_volume_id.as_deref())
        .filter_map(|id| Uuid::parse_str(id).ok())
        .map(|id| MigrationVolumeKey(id).encode())
        .collect();
    keys.push(job_id.to_string());
    keys
}

async fn lookup_progress(
    source_agent: &dyn SourceAgentClient,
    keys: &[String],
) -> Result<SourceAgentReply> {
    let mut saw_unreachable = false;
    for key in keys {
        match source_agent.get_progress(key).await? {
            SourceAgentReply::Found(progress) => return Ok(SourceAgentReply::Found(progress)),
            SourceAgentReply::Unreachable => saw_unreachable = true,
            SourceAgentReply::NotFound => {}
        }
    }
    if saw_unreachable {
        Ok(SourceAgentReply::Unreachable)
    } else {
        Ok(SourceAgentReply::NotFound)
    }
}

async fn poll_one(
    db: &PgPool,
    source_agent: &dyn SourceAgentClient,
    job: ReplicationJob,
    started_at: DateTime<Utc>,
    grace_period: Duration,
) -> PollOutcome {
    let disks = VmDisk::find_by_vm_context(job.vm_context_id, db).await.unwrap_or_default();
    let keys = candidate_keys(job.id, &disks);

    let reply = match lookup_progress(source_agent, &keys).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "progress lookup failed");
            SourceAgentReply::Unreachable
        }
    };

    match reply {
        SourceAgentReply::Found(progress) => {
            if apply_progress(db, &job, &progress).await {
                PollOutcome::Terminalized
            } else {
                PollOutcome::Continue
            }
        }
        SourceAgentReply::NotFound => {
            let elapsed = Utc::now() - started_at;
            if elapsed <= chrono::Duration::from_std(grace_period).unwrap() {
                debug!(job_id = %job.id, "not yet indexed by source agent, within grace period");
                PollOutcome::Continue
            } else {
                info!(job_id = %job.id, "source agent reports job no longer exists; stopping polling (recovery decides)");
                PollOutcome::StopPolling { job_id: job.id }
            }
        }
        SourceAgentReply::Unreachable => {
            warn!(job_id = %job.id, "source agent unreachable");
            PollOutcome::TransportError { job: Box::new(job) }
        }
    }
}

/// Applies a progress update and, if the source agent reports a terminal
/// phase/status, terminalizes the job. Returns whether it did.
async fn apply_progress(db: &PgPool, job: &ReplicationJob, progress: &AgentProgress) -> bool {
    let replication_type = match progress.sync_type.as_str() {
        "incremental" => ReplicationType::Incremental,
        _ => ReplicationType::Initial,
    };

    if let Err(e) = job
        .update_progress(
            progress.percentage,
            progress.bytes_transferred,
            progress.total_bytes,
            db,
        )
        .await
    {
        warn!(job_id = %job.id, error = %e, "failed to persist progress update");
        return false;
    }
    if replication_type != job.replication_type {
        if let Err(e) = job.set_replication_type(replication_type, db).await {
            warn!(job_id = %job.id, error = %e, "failed to persist replication type");
        }
    }

    if progress.phase == "completed" || progress.status == "completed" {
        terminalize(db, job, JobStatus::Completed, None, None, None).await;
        true
    } else if progress.status == "failed" {
        let message = progress
            .last_error
            .clone()
            .or_else(|| progress.errors.first().cloned())
            .unwrap_or_else(|| "replication failed on source agent".to_string());
        terminalize_failed(db, job, "vma_reported_failure", Some(message)).await;
        true
    } else {
        false
    }
}

async fn terminalize_failed(db: &PgPool, job: &ReplicationJob, classification: &str, message: Option<String>) {
    terminalize(
        db,
        job,
        JobStatus::Failed,
        message.or_else(|| Some(classification.to_string())),
        Some(classification.to_string()),
        None,
    )
    .await;
}

/// Terminalize the job and, in the same transaction, clear the VMContext's
/// active job and bump its success/failure counter (spec §4.3/§5: "multi-row
/// updates across tables must be in one transaction").
async fn terminalize(
    db: &PgPool,
    job: &ReplicationJob,
    status: JobStatus,
    error_message: Option<String>,
    error_classification: Option<String>,
    error_details: Option<serde_json::Value>,
) {
    let mut tx = match db.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "failed to open transaction for terminalization");
            return;
        }
    };

    if let Err(e) = job
        .mark_terminal(
            status,
            error_message.as_deref(),
            error_classification.as_deref(),
            error_details,
            &mut tx,
        )
        .await
    {
        warn!(job_id = %job.id, error = %e, "failed to mark job terminal");
        return;
    }

    if let Ok(Some(ctx)) = VmContext::find_by_current_job_id(job.id, db).await {
        if let Err(e) = ctx.finish_job(status == JobStatus::Completed, &mut tx).await {
            warn!(job_id = %job.id, error = %e, "failed to finalize VMContext after job terminalization");
            return;
        }
    }

    if let Err(e) = tx.commit().await {
        warn!(job_id = %job.id, error = %e, "failed to commit job terminalization");
    }
}

#[async_trait]
impl Service for ProgressPoller {
    fn name(&self) -> &'static str {
        "progress-poller"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        let mut interval = tokio::time::interval(self.config.poll_tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_keys_prefers_per_volume_export_name() {
        let job_id = Uuid::new_v4();
        let vol_id = Uuid::new_v4();
        let disk = VmDisk::builder()
            .vm_context_id(Uuid::new_v4())
            .source_disk_key("scsi0:0")
            .capacity_bytes(1024_i64)
            .backend_volume_id(vol_id.to_string())
            .build();
        let keys = candidate_keys(job_id, &[disk]);
        assert_eq!(keys[0], MigrationVolumeKey(vol_id).encode());
        assert_eq!(keys[1], job_id.to_string());
    }

    #[test]
    fn candidate_keys_falls_back_to_job_id_without_disks() {
        let job_id = Uuid::new_v4();
        let keys = candidate_keys(job_id, &[]);
        assert_eq!(keys, vec![job_id.to_string()]);
    }

    #[test]
    fn sync_type_mapping_collapses_unknown_to_initial() {
        assert!(matches!(
            match "incremental" {
                "incremental" => ReplicationType::Incremental,
                _ => ReplicationType::Initial,
            },
            ReplicationType::Incremental
        ));
        assert!(matches!(
            match "full" {
                "incremental" => ReplicationType::Incremental,
                _ => ReplicationType::Initial,
            },
            ReplicationType::Initial
        ));
    }
}
