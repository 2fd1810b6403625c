//! Authoritative deployment record per (service, target)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::Phase;
use crate::errors::DeployError;
use crate::models::instance::Instance;
use crate::models::target::SlotKey;
use crate::storage::layout::StorageLayout;

/// What is deployed where, as of the last finished attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub service: String,
    pub host: String,
    /// Instance left active by the last attempt, `None` if nothing runs
    pub active: Option<Instance>,
    pub last_attempt_id: Uuid,
    pub last_phase: Phase,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Record persistence; file backed, or memory only when no layout is given
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    layout: Option<StorageLayout>,
    memory: Arc<Mutex<HashMap<SlotKey, DeploymentRecord>>>,
}

impl RecordStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout: Some(layout),
            memory: Arc::default(),
        }
    }

    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn load(&self, slot: &SlotKey) -> Result<Option<DeploymentRecord>, DeployError> {
        match &self.layout {
            Some(layout) => layout
                .record_file(slot)
                .read_json_opt()
                .await
                .map_err(|e| DeployError::Storage(format!("cannot read record for {}: {}", slot, e))),
            None => Ok(self.lock().get(slot).cloned()),
        }
    }

    /// Replace the record for the record's slot
    pub async fn save(&self, record: &DeploymentRecord) -> Result<(), DeployError> {
        let slot = SlotKey {
            service: record.service.clone(),
            host: record.host.clone(),
        };
        match &self.layout {
            Some(layout) => layout
                .record_file(&slot)
                .write_json(record)
                .await
                .map_err(|e| DeployError::Storage(format!("cannot write record for {}: {}", slot, e))),
            None => {
                self.lock().insert(slot, record.clone());
                Ok(())
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SlotKey, DeploymentRecord>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::dir::Dir;
    use crate::models::target::DeploymentTarget;

    fn record(slot: &SlotKey, phase: Phase) -> DeploymentRecord {
        DeploymentRecord {
            service: slot.service.clone(),
            host: slot.host.clone(),
            active: Some(Instance {
                service_name: slot.service.clone(),
                container_id: "c0ffee".into(),
                artifact_version: "ghcr.io/acme/api:1.0".into(),
                artifact_digest: "sha256:d1".into(),
                started_at: Utc::now(),
            }),
            last_attempt_id: Uuid::new_v4(),
            last_phase: phase,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_file_store_replaces_record() {
        let dir = Dir::create_temp_dir("shipwright-records").await.unwrap();
        let store = RecordStore::new(StorageLayout::new(dir.path()));
        let slot = SlotKey::new("api", &DeploymentTarget::new("10.0.0.5"));

        assert!(store.load(&slot).await.unwrap().is_none());
        store.save(&record(&slot, Phase::Committed)).await.unwrap();
        let mut second = record(&slot, Phase::RolledBack);
        second.last_error = Some("health check timed out".into());
        store.save(&second).await.unwrap();

        let loaded = store.load(&slot).await.unwrap().unwrap();
        assert_eq!(loaded, second);
        assert!(dir.file("records/api@10.0.0.5.json").exists().await);

        dir.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_is_shared_between_clones() {
        let store = RecordStore::in_memory();
        let slot = SlotKey::new("api", &DeploymentTarget::new("local"));
        store.clone().save(&record(&slot, Phase::Committed)).await.unwrap();
        assert!(store.load(&slot).await.unwrap().is_some());
    }
}
