//! BackingChain - ordered full+incremental backup artifacts per VM (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub id: Uuid,
    pub vm_context_id: Uuid,
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_artifact_id: Option<String>,
    pub is_full: bool,
    pub created_at: DateTime<Utc>,
}

/// In-memory view over a VM's backup artifacts, ordered parent-first.
#[derive(Debug, Clone, Default)]
pub struct BackingChain {
    pub vm_context_id: Option<Uuid>,
    pub artifacts: Vec<BackupArtifact>,
}

impl BackingChain {
    pub fn from_artifacts(vm_context_id: Uuid, mut artifacts: Vec<BackupArtifact>) -> Self {
        artifacts.sort_by_key(|a| a.created_at);
        Self {
            vm_context_id: Some(vm_context_id),
            artifacts,
        }
    }

    /// Every incremental in the chain references a parent already present,
    /// and exactly one full backup roots it.
    pub fn is_consistent(&self) -> bool {
        let full_count = self.artifacts.iter().filter(|a| a.is_full).count();
        if full_count != 1 {
            return false;
        }

        let mut seen = std::collections::HashSet::new();
        for artifact in &self.artifacts {
            if !artifact.is_full {
                match &artifact.parent_artifact_id {
                    Some(parent) if seen.contains(parent) => {}
                    _ => return false,
                }
            }
            seen.insert(artifact.artifact_id.clone());
        }
        true
    }

    pub fn latest(&self) -> Option<&BackupArtifact> {
        self.artifacts.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(id: &str, parent: Option<&str>, is_full: bool, ts: i64) -> BackupArtifact {
        BackupArtifact {
            id: Uuid::new_v4(),
            vm_context_id: Uuid::new_v4(),
            artifact_id: id.to_string(),
            parent_artifact_id: parent.map(|s| s.to_string()),
            is_full,
            created_at: DateTime::from_timestamp(ts, 0).unwrap(),
        }
    }

    #[test]
    fn chain_with_single_full_is_consistent() {
        let chain = BackingChain::from_artifacts(
            Uuid::new_v4(),
            vec![artifact("full-1", None, true, 0)],
        );
        assert!(chain.is_consistent());
    }

    #[test]
    fn chain_with_valid_incremental_is_consistent() {
        let chain = BackingChain::from_artifacts(
            Uuid::new_v4(),
            vec![
                artifact("full-1", None, true, 0),
                artifact("inc-1", Some("full-1"), false, 1),
            ],
        );
        assert!(chain.is_consistent());
    }

    #[test]
    fn chain_with_dangling_parent_is_inconsistent() {
        let chain = BackingChain::from_artifacts(
            Uuid::new_v4(),
            vec![artifact("inc-1", Some("missing"), false, 1)],
        );
        assert!(!chain.is_consistent());
    }

    #[test]
    fn chain_with_zero_full_backups_is_inconsistent() {
        let chain = BackingChain::from_artifacts(
            Uuid::new_v4(),
            vec![artifact("inc-1", Some("full-1"), false, 1)],
        );
        assert!(!chain.is_consistent());
    }
}
