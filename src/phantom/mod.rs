//! Phantom Detector (C5) — multi-signal detection of jobs that no longer
//! exist on the source (spec §4.5).
//!
//! Detection is read-only; marking a detected phantom as failed is a
//! separate, explicitly invoked action. Recovery (C4) is the sole writer of
//! startup-time transitions, so this detector never runs unprompted at
//! startup — it is advisory thereafter (SPEC_FULL.md §9).

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::clients::SourceAgentClient;
use crate::clients::SourceAgentReply;
use crate::codec::MigrationVolumeKey;
use crate::error::Result;
use crate::models::{JobStatus, ReplicationJob, VmContext, VmDisk};

const STAGNATION_HOURS: i64 = 2;
const IMPOSSIBLE_STATE_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomVerdict {
    pub is_phantom: bool,
    pub reason: Option<String>,
}

impl PhantomVerdict {
    fn no() -> Self {
        Self {
            is_phantom: false,
            reason: None,
        }
    }

    fn yes(reason: impl Into<String>) -> Self {
        Self {
            is_phantom: true,
            reason: Some(reason.into()),
        }
    }
}

pub struct PhantomDetector {
    db: PgPool,
    source_agent: Arc<dyn SourceAgentClient>,
}

impl PhantomDetector {
    pub fn new(db: PgPool, source_agent: Arc<dyn SourceAgentClient>) -> Self {
        Self { db, source_agent }
    }

    /// Applies the three tiers in order, returning "phantom" on the first
    /// positive (spec §4.5).
    pub async fn inspect(&self, job: &ReplicationJob) -> PhantomVerdict {
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
                Err(_) => saw_unreachable = true,
            }
        }
        if matches!(reply, SourceAgentReply::NotFound) && saw_unreachable {
            reply = SourceAgentReply::Unreachable;
        }

        // A valid, just-retrieved progress payload is conclusive: never
        // flag phantom regardless of staleness elsewhere (spec §8 phantom
        // conservatism).
        if matches!(reply, SourceAgentReply::Found(_)) {
            return PhantomVerdict::no();
        }

        // Tier 1: source API truth.
        if matches!(reply, SourceAgentReply::NotFound) {
            return PhantomVerdict::yes("Source agent definitively reports job not found");
        }

        // Tier 2: progress stagnation + source unreachable.
        let stagnant = Utc::now() - job.updated_at > chrono::Duration::hours(STAGNATION_HOURS);
        if stagnant {
            return PhantomVerdict::yes("Progress stagnant for over 2h and source has no signal");
        }

        // Tier 3: impossible state.
        if job.status == JobStatus::Replicating && job.progress_percent == 0 {
            if let Some(started_at) = job.started_at {
                if Utc::now() - started_at > chrono::Duration::minutes(IMPOSSIBLE_STATE_MINUTES) {
                    return PhantomVerdict::yes(
                        "Impossible state: claims replicating but zero progress >30min",
                    );
                }
            }
        }

        PhantomVerdict::no()
    }

    /// Explicit marking action, separate from detection (spec §4.5).
    pub async fn mark_phantom(&self, job: &ReplicationJob) -> Result<()> {
        let mut tx = self.db.begin().await?;

        job.mark_terminal(
            JobStatus::Failed,
            Some("Job marked as phantom by automated detection"),
            Some("job_lost"),
            None,
            &mut tx,
        )
        .await?;

        if let Some(ctx) = VmContext::find_by_current_job_id(job.id, &self.db).await? {
            ctx.finish_job(false, &mut tx).await?;
        }

        tx.commit().await?;
        info!(job_id = %job.id, "marked job as phantom");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_constructors() {
        assert!(!PhantomVerdict::no().is_phantom);
        let yes = PhantomVerdict::yes("reason");
        assert!(yes.is_phantom);
        assert_eq!(yes.reason.as_deref(), Some("reason"));
    }
}
