//! Discovery Ingestion (C10) — normalizes a source-platform VM catalog into
//! internal VMContext/VMDisk rows (spec §4.10).

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{VmContext, VmDisk};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDisk {
    pub path: String,
    pub capacity_bytes: i64,
    pub datastore: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogVm {
    pub platform_vm_id: String,
    pub name: String,
    pub host: Option<String>,
    pub datacenter: Option<String>,
    pub guest_os: String,
    pub disks: Vec<CatalogDisk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
    Other,
    Unknown,
}

/// Collapses the source's free-form guest-OS string into a fixed family via
/// lowercase substring matches (spec §4.10).
pub fn classify_os(guest_os: &str) -> OsFamily {
    let lower = guest_os.to_lowercase();
    if lower.is_empty() {
        return OsFamily::Unknown;
    }
    if lower.contains("windows") {
        OsFamily::Windows
    } else if lower.contains("linux") || lower.contains("ubuntu") || lower.contains("centos") || lower.contains("debian") {
        OsFamily::Linux
    } else if lower.contains("mac") || lower.contains("darwin") || lower.contains("osx") {
        OsFamily::Macos
    } else {
        OsFamily::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { context_id: String },
    Skipped { context_id: String, reason: String },
}

pub struct DiscoveryIngestion {
    db: PgPool,
    active_iaas_config_id: Option<Uuid>,
}

impl DiscoveryIngestion {
    pub fn new(db: PgPool, active_iaas_config_id: Option<Uuid>) -> Self {
        if active_iaas_config_id.is_none() {
            warn!("no active IaaS configuration flagged; replication remains blocked until set");
        }
        Self {
            db,
            active_iaas_config_id,
        }
    }

    pub async fn ingest(&self, catalog: Vec<CatalogVm>) -> Result<Vec<IngestOutcome>> {
        let mut outcomes = Vec::with_capacity(catalog.len());

        for vm in catalog {
            let context_id = vm.platform_vm_id.clone();
            if VmContext::find_by_context_id(&context_id, &self.db).await?.is_some() {
                outcomes.push(IngestOutcome::Skipped {
                    context_id,
                    reason: "VM already present".to_string(),
                });
                continue;
            }

            let builder = VmContext::builder()
                .context_id(context_id.clone())
                .vm_name(vm.name)
                .platform_vm_id(vm.platform_vm_id)
                .platform_host(vm.host.unwrap_or_default())
                .datacenter(vm.datacenter.unwrap_or_default())
                .auto_added(true);
            let ctx = match self.active_iaas_config_id {
                Some(config_id) => builder.target_platform_config_id(config_id).build(),
                None => builder.build(),
            };
            let ctx = ctx.insert(&self.db).await?;

            for disk in vm.disks {
                let vm_disk = VmDisk::builder()
                    .vm_context_id(ctx.id)
                    .source_disk_key(disk.path)
                    .capacity_bytes(disk.capacity_bytes)
                    .datastore(disk.datastore.unwrap_or_default())
                    .build();
                vm_disk.insert(&self.db).await?;
            }

            outcomes.push(IngestOutcome::Created { context_id });
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_guest_os_strings() {
        assert_eq!(classify_os("Microsoft Windows Server 2019"), OsFamily::Windows);
        assert_eq!(classify_os("Ubuntu Linux 22.04"), OsFamily::Linux);
        assert_eq!(classify_os("macOS Ventura"), OsFamily::Macos);
        assert_eq!(classify_os("FreeBSD"), OsFamily::Other);
        assert_eq!(classify_os(""), OsFamily::Unknown);
    }
}
