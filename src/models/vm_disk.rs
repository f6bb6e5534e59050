//! VMDisk - one disk belonging to a VM (spec §3).
//!
//! Change tracking is per disk, not per VM: `change_id` here is
//! authoritative for incremental resume (spec §9); `ReplicationJob::change_id`
//! is a convenience cache and must not be used for correctness-critical code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::Result;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct VmDisk {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub vm_context_id: Uuid,
    /// Identifies the disk on the source platform (e.g. `scsi0:0`).
    pub source_disk_key: String,
    pub capacity_bytes: i64,
    #[builder(default, setter(strip_option))]
    pub datastore: Option<String>,
    #[builder(default, setter(strip_option))]
    pub provisioning_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub change_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub backend_volume_id: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl VmDisk {
    /// Disks belong to the VM, not to any single job — a VM's disk set
    /// persists across however many replication jobs run against it over
    /// time, so every lookup is keyed on `vm_context_id`.
    pub async fn find_by_vm_context(vm_context_id: Uuid, db: &PgPool) -> Result<Vec<Self>> {
        let disks = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, vm_context_id, source_disk_key, capacity_bytes, datastore,
                   provisioning_type, change_id, backend_volume_id, created_at, updated_at
            FROM vm_disks
            WHERE vm_context_id = $1
            ORDER BY source_disk_key
            "#,
        )
        .bind(vm_context_id)
        .fetch_all(db)
        .await?;

        Ok(disks)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let disk = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO vm_disks (
                id, vm_context_id, source_disk_key, capacity_bytes, datastore,
                provisioning_type, change_id, backend_volume_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, vm_context_id, source_disk_key, capacity_bytes, datastore,
                      provisioning_type, change_id, backend_volume_id, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(self.vm_context_id)
        .bind(&self.source_disk_key)
        .bind(self.capacity_bytes)
        .bind(&self.datastore)
        .bind(&self.provisioning_type)
        .bind(&self.change_id)
        .bind(&self.backend_volume_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;

        Ok(disk)
    }

    /// Record the authoritative CBT cursor after a completion endpoint call.
    pub async fn record_change_id(&self, change_id: &str, db: &PgPool) -> Result<()> {
        sqlx::query("UPDATE vm_disks SET change_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(change_id)
            .bind(self.id)
            .execute(db)
            .await?;

        Ok(())
    }
}
