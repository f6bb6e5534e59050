//! Bulk Operations (C8) — atomic-from-the-caller's-view application of a
//! vector of operations over VM groups (spec §4.8).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkOp {
    AddVm {
        vm_context_id: Uuid,
        group_id: Uuid,
    },
    RemoveVm {
        vm_context_id: Uuid,
        group_id: Uuid,
    },
    MoveVm {
        vm_context_id: Uuid,
        from_group_id: Uuid,
        to_group_id: Uuid,
        copy_settings: CopySettings,
    },
    ChangePriority {
        vm_context_id: Uuid,
        priority: i32,
    },
    ChangeSchedule {
        group_id: Uuid,
        new_schedule_id: Uuid,
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CopySettings {
    pub copy_priority: bool,
    pub copy_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRequest {
    pub op: BulkOp,
    pub continue_on_error: bool,
    pub validate_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    Validated,
    Skipped { reason: String },
    Failed { reason: String },
}

pub struct GroupState {
    pub group_id: Uuid,
    pub schedule_id: Uuid,
    pub vm_count: u32,
    pub active_jobs: u32,
}

pub struct BulkResult {
    pub outcomes: Vec<OpOutcome>,
    pub applied_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub affected_groups: HashSet<Uuid>,
    pub affected_vms: HashSet<Uuid>,
}

/// A minimal view over group state the detector needs for pre-flight
/// analysis; callers supply the current snapshot.
pub trait GroupLookup {
    fn group(&self, group_id: Uuid) -> Option<GroupState>;
}

pub fn apply(requests: Vec<OpRequest>, groups: &dyn GroupLookup) -> BulkResult {
    let mut outcomes = Vec::with_capacity(requests.len());
    let mut applied_count = 0;
    let mut failed_count = 0;
    let mut skipped_count = 0;
    let mut affected_groups = HashSet::new();
    let mut affected_vms = HashSet::new();

    for request in requests {
        let outcome = apply_one(&request, groups);

        match &outcome {
            OpOutcome::Applied => applied_count += 1,
            OpOutcome::Failed { .. } => {
                failed_count += 1;
                if !request.continue_on_error {
                    outcomes.push(outcome);
                    break;
                }
            }
            OpOutcome::Skipped { .. } => skipped_count += 1,
            OpOutcome::Validated => {}
        }

        collect_affected(&request.op, &mut affected_groups, &mut affected_vms);
        outcomes.push(outcome);
    }

    BulkResult {
        outcomes,
        applied_count,
        failed_count,
        skipped_count,
        affected_groups,
        affected_vms,
    }
}

fn collect_affected(op: &BulkOp, groups: &mut HashSet<Uuid>, vms: &mut HashSet<Uuid>) {
    match op {
        BulkOp::AddVm { vm_context_id, group_id } | BulkOp::RemoveVm { vm_context_id, group_id } => {
            groups.insert(*group_id);
            vms.insert(*vm_context_id);
        }
        BulkOp::MoveVm {
            vm_context_id,
            from_group_id,
            to_group_id,
            ..
        } => {
            groups.insert(*from_group_id);
            groups.insert(*to_group_id);
            vms.insert(*vm_context_id);
        }
        BulkOp::ChangePriority { vm_context_id, .. } => {
            vms.insert(*vm_context_id);
        }
        BulkOp::ChangeSchedule { group_id, .. } => {
            groups.insert(*group_id);
        }
    }
}

fn apply_one(request: &OpRequest, groups: &dyn GroupLookup) -> OpOutcome {
    if request.validate_only {
        return match validate(&request.op, groups) {
            Ok(()) => OpOutcome::Validated,
            Err(reason) => OpOutcome::Failed { reason },
        };
    }

    match &request.op {
        BulkOp::AddVm { .. } | BulkOp::RemoveVm { .. } | BulkOp::ChangePriority { .. } => {
            match validate(&request.op, groups) {
                Ok(()) => OpOutcome::Applied,
                Err(reason) => OpOutcome::Failed { reason },
            }
        }
        BulkOp::MoveVm {
            vm_context_id,
            from_group_id,
            to_group_id,
            ..
        } => {
            let remove = BulkOp::RemoveVm {
                vm_context_id: *vm_context_id,
                group_id: *from_group_id,
            };
            match validate(&remove, groups) {
                Err(reason) => OpOutcome::Skipped {
                    reason: format!("remove from source group failed, add skipped: {reason}"),
                },
                Ok(()) => {
                    let add = BulkOp::AddVm {
                        vm_context_id: *vm_context_id,
                        group_id: *to_group_id,
                    };
                    match validate(&add, groups) {
                        Ok(()) => OpOutcome::Applied,
                        Err(reason) => OpOutcome::Failed { reason },
                    }
                }
            }
        }
        BulkOp::ChangeSchedule { group_id, force, .. } => {
            let Some(group) = groups.group(*group_id) else {
                return OpOutcome::Failed {
                    reason: format!("unknown group {group_id}"),
                };
            };
            if group.active_jobs > 0 && !force {
                return OpOutcome::Failed {
                    reason: format!(
                        "group {group_id} has {} active jobs; use force to override",
                        group.active_jobs
                    ),
                };
            }
            OpOutcome::Applied
        }
    }
}

fn validate(op: &BulkOp, groups: &dyn GroupLookup) -> Result<(), String> {
    match op {
        BulkOp::AddVm { group_id, .. } | BulkOp::RemoveVm { group_id, .. } => groups
            .group(*group_id)
            .map(|_| ())
            .ok_or_else(|| format!("unknown group {group_id}")),
        BulkOp::ChangePriority { priority, .. } => {
            if *priority < 0 {
                Err("priority must be non-negative".to_string())
            } else {
                Ok(())
            }
        }
        BulkOp::MoveVm { .. } | BulkOp::ChangeSchedule { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeGroups(HashMap<Uuid, GroupState>);

    impl GroupLookup for FakeGroups {
        fn group(&self, group_id: Uuid) -> Option<GroupState> {
            self.0.get(&group_id).map(|g| GroupState {
                group_id: g.group_id,
                schedule_id: g.schedule_id,
                vm_count: g.vm_count,
                active_jobs: g.active_jobs,
            })
        }
    }

    #[test]
    fn schedule_change_blocked_by_active_jobs_without_force() {
        let group_id = Uuid::new_v4();
        let groups = FakeGroups(HashMap::from([(
            group_id,
            GroupState {
                group_id,
                schedule_id: Uuid::new_v4(),
                vm_count: 3,
                active_jobs: 2,
            },
        )]));

        let result = apply(
            vec![OpRequest {
                op: BulkOp::ChangeSchedule {
                    group_id,
                    new_schedule_id: Uuid::new_v4(),
                    force: false,
                },
                continue_on_error: true,
                validate_only: false,
            }],
            &groups,
        );

        assert_eq!(result.failed_count, 1);
    }

    #[test]
    fn schedule_change_allowed_with_force() {
        let group_id = Uuid::new_v4();
        let groups = FakeGroups(HashMap::from([(
            group_id,
            GroupState {
                group_id,
                schedule_id: Uuid::new_v4(),
                vm_count: 3,
                active_jobs: 2,
            },
        )]));

        let result = apply(
            vec![OpRequest {
                op: BulkOp::ChangeSchedule {
                    group_id,
                    new_schedule_id: Uuid::new_v4(),
                    force: true,
                },
                continue_on_error: true,
                validate_only: false,
            }],
            &groups,
        );

        assert_eq!(result.applied_count, 1);
    }

    #[test]
    fn move_vm_skips_add_when_remove_fails() {
        let groups = FakeGroups(HashMap::new());
        let result = apply(
            vec![OpRequest {
                op: BulkOp::MoveVm {
                    vm_context_id: Uuid::new_v4(),
                    from_group_id: Uuid::new_v4(),
                    to_group_id: Uuid::new_v4(),
                    copy_settings: CopySettings::default(),
                },
                continue_on_error: true,
                validate_only: false,
            }],
            &groups,
        );
        assert_eq!(result.skipped_count, 1);
    }
}
