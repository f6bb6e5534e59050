//! In-memory IaaS state cache, guarded by a single reader-writer lock;
//! external getters return deep copies (spec §5).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clients::{IaasVm, IaasVolume};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Missing,
}

#[derive(Debug, Clone)]
pub enum CacheEntry {
    Vm(IaasVm),
    Volume(IaasVolume),
}

#[derive(Debug, Clone)]
struct Slot<T> {
    value: T,
    sync_status: SyncStatus,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    vms: HashMap<String, Slot<IaasVm>>,
    volumes: HashMap<String, Slot<IaasVolume>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    VmChanged { id: String },
    VolumeChanged { id: String },
    VmMissing { id: String },
    VolumeMissing { id: String },
}

pub struct StateCache {
    inner: RwLock<Inner>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot, diffing against the previous one and
    /// returning change events for any observable difference
    /// (state/offering/attachment/device-index/size), per spec §4.7.
    ///
    /// An entity present in the cache but absent from this scan is flipped
    /// to `missing` and an event is emitted immediately — there is no
    /// grace period. Reappearing resets it to `synced`.
    pub fn refresh(&self, vms: Vec<IaasVm>, volumes: Vec<IaasVolume>) -> Vec<ChangeEvent> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let mut events = Vec::new();

        let mut seen_vms = std::collections::HashSet::new();
        for vm in vms {
            seen_vms.insert(vm.id.clone());
            let changed = inner
                .vms
                .get(&vm.id)
                .map(|slot| !vm_equal(&slot.value, &vm))
                .unwrap_or(true);
            if changed {
                events.push(ChangeEvent::VmChanged { id: vm.id.clone() });
            }
            inner.vms.insert(
                vm.id.clone(),
                Slot {
                    value: vm,
                    sync_status: SyncStatus::Synced,
                    last_seen: now,
                },
            );
        }
        for (id, slot) in inner.vms.iter_mut() {
            if seen_vms.contains(id) {
                continue;
            }
            if slot.sync_status != SyncStatus::Missing {
                slot.sync_status = SyncStatus::Missing;
                events.push(ChangeEvent::VmMissing { id: id.clone() });
            }
        }

        let mut seen_volumes = std::collections::HashSet::new();
        for volume in volumes {
            seen_volumes.insert(volume.id.clone());
            let changed = inner
                .volumes
                .get(&volume.id)
                .map(|slot| !volume_equal(&slot.value, &volume))
                .unwrap_or(true);
            if changed {
                events.push(ChangeEvent::VolumeChanged { id: volume.id.clone() });
            }
            inner.volumes.insert(
                volume.id.clone(),
                Slot {
                    value: volume,
                    sync_status: SyncStatus::Synced,
                    last_seen: now,
                },
            );
        }
        for (id, slot) in inner.volumes.iter_mut() {
            if seen_volumes.contains(id) {
                continue;
            }
            if slot.sync_status != SyncStatus::Missing {
                slot.sync_status = SyncStatus::Missing;
                events.push(ChangeEvent::VolumeMissing { id: id.clone() });
            }
        }

        events
    }

    /// Timestamp of the last refresh that observed this VM, for staleness
    /// introspection (spec §3 glossary: "last-seen timestamp").
    pub fn vm_last_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().vms.get(id).map(|s| s.last_seen)
    }

    pub fn volume_last_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.inner.read().unwrap().volumes.get(id).map(|s| s.last_seen)
    }

    pub fn get_vm(&self, id: &str) -> Option<IaasVm> {
        self.inner.read().unwrap().vms.get(id).map(|s| s.value.clone())
    }

    pub fn get_volume(&self, id: &str) -> Option<IaasVolume> {
        self.inner.read().unwrap().volumes.get(id).map(|s| s.value.clone())
    }

    pub fn all_vms(&self) -> Vec<IaasVm> {
        self.inner.read().unwrap().vms.values().map(|s| s.value.clone()).collect()
    }

    pub fn all_volumes(&self) -> Vec<IaasVolume> {
        self.inner
            .read()
            .unwrap()
            .volumes
            .values()
            .map(|s| s.value.clone())
            .collect()
    }

    pub fn upsert_volume(&self, volume: IaasVolume) {
        let mut inner = self.inner.write().unwrap();
        inner.volumes.insert(
            volume.id.clone(),
            Slot {
                value: volume,
                sync_status: SyncStatus::Synced,
                last_seen: Utc::now(),
            },
        );
    }

    pub fn remove_volume(&self, id: &str) {
        self.inner.write().unwrap().volumes.remove(id);
    }
}

fn vm_equal(a: &IaasVm, b: &IaasVm) -> bool {
    a.state == b.state && a.service_offering == b.service_offering && a.attached_volumes == b.attached_volumes
}

fn volume_equal(a: &IaasVolume, b: &IaasVolume) -> bool {
    a.state == b.state
        && a.attached_to_vm_id == b.attached_to_vm_id
        && a.device_index == b.device_index
        && a.size_bytes == b.size_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str, state: &str) -> IaasVm {
        IaasVm {
            id: id.to_string(),
            state: state.to_string(),
            service_offering: "small".to_string(),
            attached_volumes: vec![],
        }
    }

    #[test]
    fn refresh_reports_change_on_state_transition() {
        let cache = StateCache::new();
        cache.refresh(vec![vm("vm-1", "running")], vec![]);
        let events = cache.refresh(vec![vm("vm-1", "stopped")], vec![]);
        assert!(events.contains(&ChangeEvent::VmChanged { id: "vm-1".to_string() }));
    }

    #[test]
    fn refresh_flips_missing_entities_to_missing_status_on_first_miss() {
        let cache = StateCache::new();
        cache.refresh(vec![vm("vm-1", "running")], vec![]);
        let events = cache.refresh(vec![], vec![]);
        assert!(events.contains(&ChangeEvent::VmMissing { id: "vm-1".to_string() }));
    }

    #[test]
    fn refresh_does_not_repeat_missing_event_once_already_missing() {
        let cache = StateCache::new();
        cache.refresh(vec![vm("vm-1", "running")], vec![]);
        cache.refresh(vec![], vec![]);
        let events = cache.refresh(vec![], vec![]);
        assert!(!events.contains(&ChangeEvent::VmMissing { id: "vm-1".to_string() }));
    }

    #[test]
    fn no_change_events_on_identical_refresh() {
        let cache = StateCache::new();
        cache.refresh(vec![vm("vm-1", "running")], vec![]);
        let events = cache.refresh(vec![vm("vm-1", "running")], vec![]);
        assert!(events.is_empty());
    }
}
