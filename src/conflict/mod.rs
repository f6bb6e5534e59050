//! Conflict Detector (C6) — pre-schedule eligibility checks against
//! concurrency/state rules (spec §4.6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::VmStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ScheduleDisabled,
    VmDisabled,
    VmInFailover,
    ActiveJob,
    SkipIfRunning,
    MaxConcurrent,
    GroupConcurrent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Eligible,
    Rejected(ConflictKind),
}

/// Per-VM scheduling candidate, enough context to run every check
/// (spec §4.6).
pub struct Candidate {
    pub vm_context_id: Uuid,
    pub vm_status: VmStatus,
    pub scheduler_enabled: bool,
    pub has_active_job: bool,
}

pub struct ScheduleContext {
    pub schedule_enabled: bool,
    pub skip_if_running: bool,
    pub max_concurrent_jobs: u32,
    pub running_schedule_jobs: u32,
    pub max_concurrent_vms_per_group: u32,
    pub running_group_jobs: u32,
}

pub struct DetectionSummary {
    pub per_vm: Vec<(Uuid, Verdict)>,
    pub conflict_counts: HashMap<ConflictKind, u32>,
}

/// Runs the ordered checks over a batch, incrementing running counters as
/// VMs are admitted so later VMs in the same batch see the new pressure
/// (spec §4.6).
pub fn detect(candidates: &[Candidate], ctx: &ScheduleContext) -> DetectionSummary {
    let mut per_vm = Vec::with_capacity(candidates.len());
    let mut conflict_counts: HashMap<ConflictKind, u32> = HashMap::new();
    let mut running_schedule_jobs = ctx.running_schedule_jobs;
    let mut running_group_jobs = ctx.running_group_jobs;

    for candidate in candidates {
        let verdict = check_one(candidate, ctx, running_schedule_jobs, running_group_jobs);
        match &verdict {
            Verdict::Eligible => {
                running_schedule_jobs += 1;
                running_group_jobs += 1;
            }
            Verdict::Rejected(kind) => {
                *conflict_counts.entry(*kind).or_insert(0) += 1;
            }
        }
        per_vm.push((candidate.vm_context_id, verdict));
    }

    DetectionSummary {
        per_vm,
        conflict_counts,
    }
}

fn check_one(
    candidate: &Candidate,
    ctx: &ScheduleContext,
    running_schedule_jobs: u32,
    running_group_jobs: u32,
) -> Verdict {
    if !ctx.schedule_enabled {
        return Verdict::Rejected(ConflictKind::ScheduleDisabled);
    }
    if !candidate.scheduler_enabled {
        return Verdict::Rejected(ConflictKind::VmDisabled);
    }
    if matches!(
        candidate.vm_status,
        VmStatus::FailedOverTest | VmStatus::FailedOverLive | VmStatus::CleanupRequired
    ) {
        return Verdict::Rejected(ConflictKind::VmInFailover);
    }
    if candidate.has_active_job {
        return Verdict::Rejected(if ctx.skip_if_running {
            ConflictKind::SkipIfRunning
        } else {
            ConflictKind::ActiveJob
        });
    }
    if running_schedule_jobs >= ctx.max_concurrent_jobs {
        return Verdict::Rejected(ConflictKind::MaxConcurrent);
    }
    if running_group_jobs >= ctx.max_concurrent_vms_per_group {
        return Verdict::Rejected(ConflictKind::GroupConcurrent);
    }

    Verdict::Eligible
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(active: bool) -> Candidate {
        Candidate {
            vm_context_id: Uuid::new_v4(),
            vm_status: VmStatus::ReadyForReplication,
            scheduler_enabled: true,
            has_active_job: active,
        }
    }

    #[test]
    fn skip_if_running_when_schedule_demands_it() {
        let ctx = ScheduleContext {
            schedule_enabled: true,
            skip_if_running: true,
            max_concurrent_jobs: 5,
            running_schedule_jobs: 0,
            max_concurrent_vms_per_group: 100,
            running_group_jobs: 0,
        };
        let candidates = vec![candidate(true)];
        let summary = detect(&candidates, &ctx);
        assert_eq!(summary.per_vm[0].1, Verdict::Rejected(ConflictKind::SkipIfRunning));
    }

    #[test]
    fn fairness_within_batch_admits_exactly_n() {
        let ctx = ScheduleContext {
            schedule_enabled: true,
            skip_if_running: true,
            max_concurrent_jobs: 5,
            running_schedule_jobs: 0,
            max_concurrent_vms_per_group: 100,
            running_group_jobs: 0,
        };
        let mut candidates = vec![candidate(true)];
        candidates.extend((0..6).map(|_| candidate(false)));
        let summary = detect(&candidates, &ctx);

        assert_eq!(summary.per_vm[0].1, Verdict::Rejected(ConflictKind::SkipIfRunning));
        let eligible = summary
            .per_vm
            .iter()
            .filter(|(_, v)| *v == Verdict::Eligible)
            .count();
        assert_eq!(eligible, 5);
        assert_eq!(
            *summary.conflict_counts.get(&ConflictKind::MaxConcurrent).unwrap(),
            1
        );
    }

    #[test]
    fn schedule_disabled_rejects_everyone_first() {
        let ctx = ScheduleContext {
            schedule_enabled: false,
            skip_if_running: false,
            max_concurrent_jobs: 5,
            running_schedule_jobs: 0,
            max_concurrent_vms_per_group: 100,
            running_group_jobs: 0,
        };
        let candidates = vec![candidate(false)];
        let summary = detect(&candidates, &ctx);
        assert_eq!(
            summary.per_vm[0].1,
            Verdict::Rejected(ConflictKind::ScheduleDisabled)
        );
    }
}
