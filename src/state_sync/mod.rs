//! State Sync (C7) — periodic refresh of the IaaS VM/volume cache plus
//! inconsistency detection and auto-fix (spec §4.7).

mod cache;

pub use cache::{CacheEntry, StateCache, SyncStatus};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::clients::IaasClient;
use crate::kernel::service_host::Service;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    VolumeAttachedToMissingVm,
    VolumeAttachmentMismatch,
    RunningVmNoVolumes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inconsistency {
    pub kind: InconsistencyKind,
    pub entity_id: String,
    pub auto_fixable: bool,
    pub fixed: bool,
}

pub struct StateSync {
    iaas: Arc<dyn IaasClient>,
    cache: Arc<StateCache>,
    max_sync_errors: u32,
    consecutive_errors: std::sync::atomic::AtomicU32,
    stopped: std::sync::atomic::AtomicBool,
    fixed_count: std::sync::atomic::AtomicU64,
}

impl StateSync {
    pub fn new(iaas: Arc<dyn IaasClient>, cache: Arc<StateCache>, max_sync_errors: u32) -> Self {
        Self {
            iaas,
            cache,
            max_sync_errors,
            consecutive_errors: std::sync::atomic::AtomicU32::new(0),
            stopped: std::sync::atomic::AtomicBool::new(false),
            fixed_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Total inconsistencies auto-fixed over this service's lifetime.
    pub fn fixed_count(&self) -> u64 {
        self.fixed_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// One refresh cycle: list VMs and volumes, diff against the previous
    /// snapshot, then run inconsistency detection (spec §4.7).
    pub async fn tick(&self) -> Vec<Inconsistency> {
        if self.is_stopped() {
            return Vec::new();
        }

        let vms = self.iaas.list_vms().await;
        let volumes = self.iaas.list_volumes().await;

        let (vms, volumes) = match (vms, volumes) {
            (Ok(vms), Ok(volumes)) => {
                self.consecutive_errors.store(0, std::sync::atomic::Ordering::SeqCst);
                (vms, volumes)
            }
            _ => {
                let errors = self
                    .consecutive_errors
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    + 1;
                warn!(errors, "state sync cycle failed");
                if errors >= self.max_sync_errors {
                    error!("state sync self-stopping after {errors} consecutive failures");
                    self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                return Vec::new();
            }
        };

        self.cache.refresh(vms.clone(), volumes.clone());
        detect_inconsistencies(&vms, &volumes)
    }
}

fn detect_inconsistencies(
    vms: &[crate::clients::IaasVm],
    volumes: &[crate::clients::IaasVolume],
) -> Vec<Inconsistency> {
    let mut findings = Vec::new();

    for volume in volumes {
        if let Some(vm_id) = &volume.attached_to_vm_id {
            let Some(vm) = vms.iter().find(|v| &v.id == vm_id) else {
                findings.push(Inconsistency {
                    kind: InconsistencyKind::VolumeAttachedToMissingVm,
                    entity_id: volume.id.clone(),
                    auto_fixable: true,
                    fixed: false,
                });
                continue;
            };

            if !vm.attached_volumes.contains(&volume.id) {
                findings.push(Inconsistency {
                    kind: InconsistencyKind::VolumeAttachmentMismatch,
                    entity_id: volume.id.clone(),
                    auto_fixable: true,
                    fixed: false,
                });
            }
        }
    }

    for vm in vms {
        if vm.state == "running" && vm.attached_volumes.is_empty() {
            findings.push(Inconsistency {
                kind: InconsistencyKind::RunningVmNoVolumes,
                entity_id: vm.id.clone(),
                auto_fixable: false,
                fixed: false,
            });
        }
    }

    findings
}

/// Re-fetches the affected entities from the IaaS and updates the cache,
/// applicable to the auto-fixable inconsistency classes (spec §4.7).
pub async fn auto_fix(iaas: &dyn IaasClient, cache: &StateCache, finding: &Inconsistency) -> bool {
    if !finding.auto_fixable {
        return false;
    }

    match finding.kind {
        InconsistencyKind::VolumeAttachedToMissingVm | InconsistencyKind::VolumeAttachmentMismatch => {
            match iaas.get_volume(&finding.entity_id).await {
                Ok(Some(volume)) => {
                    cache.upsert_volume(volume);
                    true
                }
                Ok(None) => {
                    cache.remove_volume(&finding.entity_id);
                    true
                }
                Err(_) => false,
            }
        }
        InconsistencyKind::RunningVmNoVolumes => false,
    }
}

/// Spawned as `Arc<StateSync>` rather than `Box<StateSync>` so the HTTP
/// surface can hold the same instance for the `/state-sync/status` endpoint
/// (spec §6).
#[async_trait]
impl Service for Arc<StateSync> {
    fn name(&self) -> &'static str {
        "state-sync"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> AnyResult<()> {
        run_with_interval(*self, shutdown, Duration::from_secs(120)).await
    }
}

async fn run_with_interval(
    service: Arc<StateSync>,
    shutdown: CancellationToken,
    tick_interval: Duration,
) -> AnyResult<()> {
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if service.is_stopped() {
                    break;
                }
                let mut findings = service.tick().await;
                for finding in &mut findings {
                    if finding.auto_fixable {
                        finding.fixed = auto_fix(service.iaas.as_ref(), &service.cache, finding).await;
                        if finding.fixed {
                            service.fixed_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{IaasVm, IaasVolume};

    fn vm(id: &str, state: &str, attached: Vec<&str>) -> IaasVm {
        IaasVm {
            id: id.to_string(),
            state: state.to_string(),
            service_offering: "small".to_string(),
            attached_volumes: attached.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    fn volume(id: &str, attached_to: Option<&str>) -> IaasVolume {
        IaasVolume {
            id: id.to_string(),
            state: "attached".to_string(),
            attached_to_vm_id: attached_to.map(|s| s.to_string()),
            device_index: Some(0),
            size_bytes: 1024,
        }
    }

    #[test]
    fn orphan_attachment_detected() {
        let vms = vec![];
        let volumes = vec![volume("VOL-9", Some("VM-X"))];
        let findings = detect_inconsistencies(&vms, &volumes);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, InconsistencyKind::VolumeAttachedToMissingVm);
    }

    #[test]
    fn asymmetric_attachment_detected() {
        let vms = vec![vm("VM-X", "running", vec!["VOL-OTHER"])];
        let volumes = vec![volume("VOL-9", Some("VM-X"))];
        let findings = detect_inconsistencies(&vms, &volumes);
        assert!(findings
            .iter()
            .any(|f| f.kind == InconsistencyKind::VolumeAttachmentMismatch));
    }

    #[test]
    fn running_vm_no_volumes_reported_not_fixed() {
        let vms = vec![vm("VM-Y", "running", vec![])];
        let volumes = vec![];
        let findings = detect_inconsistencies(&vms, &volumes);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, InconsistencyKind::RunningVmNoVolumes);
        assert!(!findings[0].auto_fixable);
    }

    #[test]
    fn consistent_state_has_no_findings() {
        let vms = vec![vm("VM-X", "running", vec!["VOL-9"])];
        let volumes = vec![volume("VOL-9", Some("VM-X"))];
        assert!(detect_inconsistencies(&vms, &volumes).is_empty());
    }
}
