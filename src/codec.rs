//! Composite-key encode/decode for the ad-hoc identifiers the source agent
//! and backend use to name per-disk artifacts (spec §9 design note):
//! `migration-vol-{uuid}` and `backup-{vm}-disk{n}-{suffix}`.
//!
//! One module, round-trip property-tested, replaces the scattered string
//! formatting the source repository did ad hoc at each call site.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed migration volume key: {0}")]
    MalformedMigrationKey(String),
    #[error("malformed backup disk key: {0}")]
    MalformedBackupKey(String),
}

/// `migration-vol-{uuid}` — the export name the source agent uses to key
/// progress for a single disk's migration (spec §6 "export name").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationVolumeKey(pub Uuid);

impl MigrationVolumeKey {
    pub fn encode(&self) -> String {
        format!("migration-vol-{}", self.0)
    }

    pub fn decode(s: &str) -> Result<Self, CodecError> {
        let uuid_part = s
            .strip_prefix("migration-vol-")
            .ok_or_else(|| CodecError::MalformedMigrationKey(s.to_string()))?;
        let id = Uuid::parse_str(uuid_part)
            .map_err(|_| CodecError::MalformedMigrationKey(s.to_string()))?;
        Ok(Self(id))
    }
}

/// `backup-{vm}-disk{n}-{suffix}` — the key identifying one disk's backup
/// artifact. `vm` and `suffix` are opaque, `disk` is the disk index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDiskKey {
    pub vm: String,
    pub disk: u32,
    pub suffix: String,
}

impl BackupDiskKey {
    pub fn encode(&self) -> String {
        format!("backup-{}-disk{}-{}", self.vm, self.disk, self.suffix)
    }

    pub fn decode(s: &str) -> Result<Self, CodecError> {
        let rest = s
            .strip_prefix("backup-")
            .ok_or_else(|| CodecError::MalformedBackupKey(s.to_string()))?;

        let disk_marker = "-disk";
        let disk_pos = rest
            .find(disk_marker)
            .ok_or_else(|| CodecError::MalformedBackupKey(s.to_string()))?;
        let vm = rest[..disk_pos].to_string();
        if vm.is_empty() {
            return Err(CodecError::MalformedBackupKey(s.to_string()));
        }

        let after_marker = &rest[disk_pos + disk_marker.len()..];
        let dash_pos = after_marker
            .find('-')
            .ok_or_else(|| CodecError::MalformedBackupKey(s.to_string()))?;
        let disk: u32 = after_marker[..dash_pos]
            .parse()
            .map_err(|_| CodecError::MalformedBackupKey(s.to_string()))?;
        let suffix = after_marker[dash_pos + 1..].to_string();
        if suffix.is_empty() {
            return Err(CodecError::MalformedBackupKey(s.to_string()));
        }

        Ok(Self { vm, disk, suffix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_key_round_trips() {
        let key = MigrationVolumeKey(Uuid::new_v4());
        let encoded = key.encode();
        assert_eq!(MigrationVolumeKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn migration_key_rejects_malformed_input() {
        assert!(MigrationVolumeKey::decode("not-a-key").is_err());
        assert!(MigrationVolumeKey::decode("migration-vol-not-a-uuid").is_err());
    }

    #[test]
    fn backup_disk_key_round_trips() {
        let key = BackupDiskKey {
            vm: "web-01".to_string(),
            disk: 2,
            suffix: "20260731T0100Z".to_string(),
        };
        let encoded = key.encode();
        assert_eq!(BackupDiskKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn backup_disk_key_round_trips_for_hyphenated_vm_names() {
        let key = BackupDiskKey {
            vm: "prod-web-01".to_string(),
            disk: 0,
            suffix: "full".to_string(),
        };
        let encoded = key.encode();
        assert_eq!(BackupDiskKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn backup_disk_key_rejects_malformed_input() {
        assert!(BackupDiskKey::decode("not-a-key").is_err());
        assert!(BackupDiskKey::decode("backup-vm-diskX-suffix").is_err());
        assert!(BackupDiskKey::decode("backup--disk1-suffix").is_err());
    }

    #[test]
    fn migration_key_round_trips_for_many_uuids() {
        for _ in 0..100 {
            let key = MigrationVolumeKey(Uuid::new_v4());
            assert_eq!(MigrationVolumeKey::decode(&key.encode()).unwrap(), key);
        }
    }
}
