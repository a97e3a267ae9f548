// Migration Checkpoints - Durable, monotonic per-key migration state
// A checkpoint is sufficient to resume a plan after crash or cancellation.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::strong_types::{ShardKey, ShardKeyValue};
use crate::error::{
    MigrationError, MigrationErrorKind, MigrationPhase, ShardisResult, StoreError,
};
use crate::infrastructure::migration::plan::KeyMoveState;

/// Durable snapshot of a plan's per-key states. `version` strictly increases
/// per plan and never decreases.
#[derive(Debug, Clone)]
pub struct MigrationCheckpoint<K: ShardKeyValue> {
    pub plan_id: Uuid,
    pub version: u64,
    pub updated_at_utc: DateTime<Utc>,
    pub states: HashMap<ShardKey<K>, KeyMoveState>,
    pub last_processed_index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyStateEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "State")]
    state: KeyMoveState,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointPayload {
    #[serde(rename = "PlanId")]
    plan_id: Uuid,
    #[serde(rename = "Version")]
    version: u64,
    #[serde(rename = "UpdatedAtUtc")]
    updated_at_utc: DateTime<Utc>,
    #[serde(rename = "States")]
    states: Vec<KeyStateEntry>,
    #[serde(rename = "LastProcessedIndex")]
    last_processed_index: usize,
}

impl<K: ShardKeyValue> MigrationCheckpoint<K> {
    fn to_payload(&self) -> CheckpointPayload {
        let mut states: Vec<KeyStateEntry> = self
            .states
            .iter()
            .map(|(key, state)| KeyStateEntry {
                key: key.canonical_string(),
                state: *state,
            })
            .collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        CheckpointPayload {
            plan_id: self.plan_id,
            version: self.version,
            updated_at_utc: self.updated_at_utc,
            states,
            last_processed_index: self.last_processed_index,
        }
    }

    fn from_payload(payload: CheckpointPayload) -> ShardisResult<Self> {
        let mut states = HashMap::with_capacity(payload.states.len());
        for entry in payload.states {
            let value = K::from_canonical(&entry.key).ok_or_else(|| {
                StoreError::serialization(format!(
                    "checkpoint key {:?} is not a valid key value",
                    entry.key
                ))
            })?;
            states.insert(ShardKey::new(value), entry.state);
        }
        Ok(Self {
            plan_id: payload.plan_id,
            version: payload.version,
            updated_at_utc: payload.updated_at_utc,
            states,
            last_processed_index: payload.last_processed_index,
        })
    }

    /// Durable JSON payload with stable property names and key ordering
    pub fn to_payload_json(&self) -> ShardisResult<String> {
        serde_json::to_string(&self.to_payload())
            .map_err(|e| StoreError::serialization(format!("checkpoint encode failed: {}", e)).into())
    }

    pub fn from_payload_json(json: &str) -> ShardisResult<Self> {
        let payload: CheckpointPayload = serde_json::from_str(json)
            .map_err(|e| StoreError::serialization(format!("checkpoint decode failed: {}", e)))?;
        Self::from_payload(payload)
    }

    /// Compact binary encoding for very large plans
    pub fn encode_compact(&self) -> ShardisResult<Vec<u8>> {
        bincode::serialize(&self.to_payload())
            .map_err(|e| StoreError::serialization(format!("checkpoint encode failed: {}", e)).into())
    }

    pub fn decode_compact(bytes: &[u8]) -> ShardisResult<Self> {
        let payload: CheckpointPayload = bincode::deserialize(bytes)
            .map_err(|e| StoreError::serialization(format!("checkpoint decode failed: {}", e)))?;
        Self::from_payload(payload)
    }
}

fn stale_version_error(plan_id: Uuid, attempted: u64, current: u64) -> MigrationError {
    MigrationError::new(
        MigrationErrorKind::CheckpointPersistFailed,
        MigrationPhase::Checkpoint,
        plan_id,
        format!(
            "version {} is not greater than persisted version {}",
            attempted, current
        ),
    )
}

/// Durable per-plan checkpoint storage. `persist` must be atomic with respect
/// to concurrent readers and reject non-monotonic versions.
#[async_trait]
pub trait CheckpointStore<K: ShardKeyValue>: Send + Sync {
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>>;
    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()>;
}

/// In-memory reference checkpoint store
pub struct InMemoryCheckpointStore<K: ShardKeyValue> {
    checkpoints: RwLock<HashMap<Uuid, MigrationCheckpoint<K>>>,
}

impl<K: ShardKeyValue> InMemoryCheckpointStore<K> {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Remove a completed plan's checkpoint
    pub async fn remove(&self, plan_id: Uuid) {
        self.checkpoints.write().await.remove(&plan_id);
    }
}

impl<K: ShardKeyValue> Default for InMemoryCheckpointStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: ShardKeyValue> CheckpointStore<K> for InMemoryCheckpointStore<K> {
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>> {
        Ok(self.checkpoints.read().await.get(&plan_id).cloned())
    }

    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        if let Some(existing) = checkpoints.get(&checkpoint.plan_id) {
            if checkpoint.version <= existing.version {
                return Err(stale_version_error(
                    checkpoint.plan_id,
                    checkpoint.version,
                    existing.version,
                )
                .into());
            }
        }
        checkpoints.insert(checkpoint.plan_id, checkpoint.clone());
        Ok(())
    }
}

/// File-backed checkpoint store using the compact binary codec. One file per
/// plan; persist writes a sibling temp file and renames it into place.
pub struct FileCheckpointStore<K: ShardKeyValue> {
    directory: PathBuf,
    _marker: std::marker::PhantomData<fn() -> K>,
}

impl<K: ShardKeyValue> FileCheckpointStore<K> {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            _marker: std::marker::PhantomData,
        }
    }

    fn path_for(&self, plan_id: Uuid) -> PathBuf {
        self.directory.join(format!("{}.ckpt", plan_id))
    }
}

#[async_trait]
impl<K: ShardKeyValue> CheckpointStore<K> for FileCheckpointStore<K> {
    async fn load(&self, plan_id: Uuid) -> ShardisResult<Option<MigrationCheckpoint<K>>> {
        let path = self.path_for(plan_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(MigrationCheckpoint::decode_compact(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::connectivity(
                format!("failed to read checkpoint {}", path.display()),
                err.into(),
            )
            .into()),
        }
    }

    async fn persist(&self, checkpoint: &MigrationCheckpoint<K>) -> ShardisResult<()> {
        if let Some(existing) = self.load(checkpoint.plan_id).await? {
            if checkpoint.version <= existing.version {
                return Err(stale_version_error(
                    checkpoint.plan_id,
                    checkpoint.version,
                    existing.version,
                )
                .into());
            }
        }

        tokio::fs::create_dir_all(&self.directory).await.map_err(|err| {
            StoreError::connectivity(
                format!("failed to create {}", self.directory.display()),
                err.into(),
            )
        })?;

        let path = self.path_for(checkpoint.plan_id);
        let tmp = self.directory.join(format!("{}.ckpt.tmp", checkpoint.plan_id));
        let bytes = checkpoint.encode_compact()?;
        tokio::fs::write(&tmp, &bytes).await.map_err(|err| {
            StoreError::connectivity(format!("failed to write {}", tmp.display()), err.into())
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|err| {
            StoreError::connectivity(format!("failed to rename {}", tmp.display()), err.into())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShardisError;

    fn checkpoint(plan_id: Uuid, version: u64) -> MigrationCheckpoint<String> {
        let mut states = HashMap::new();
        states.insert(ShardKey::new("k1".to_string()), KeyMoveState::Copied);
        states.insert(ShardKey::new("k2".to_string()), KeyMoveState::Swapped);
        MigrationCheckpoint {
            plan_id,
            version,
            updated_at_utc: Utc::now(),
            states,
            last_processed_index: 1,
        }
    }

    #[test]
    fn test_payload_json_shape() {
        let plan_id = Uuid::new_v4();
        let ckpt = checkpoint(plan_id, 3);
        let json = ckpt.to_payload_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["PlanId"], serde_json::json!(plan_id.to_string()));
        assert_eq!(value["Version"], serde_json::json!(3));
        assert_eq!(value["LastProcessedIndex"], serde_json::json!(1));
        let states = value["States"].as_array().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0]["Key"], serde_json::json!("k1"));
        assert_eq!(states[0]["State"], serde_json::json!("Copied"));

        let decoded = MigrationCheckpoint::<String>::from_payload_json(&json).unwrap();
        assert_eq!(decoded.version, 3);
        assert_eq!(
            decoded.states.get(&ShardKey::new("k2".to_string())),
            Some(&KeyMoveState::Swapped)
        );
    }

    #[test]
    fn test_compact_codec_roundtrip() {
        let ckpt = checkpoint(Uuid::new_v4(), 7);
        let bytes = ckpt.encode_compact().unwrap();
        let decoded = MigrationCheckpoint::<String>::decode_compact(&bytes).unwrap();
        assert_eq!(decoded.plan_id, ckpt.plan_id);
        assert_eq!(decoded.version, 7);
        assert_eq!(decoded.states.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_store_version_monotonic() {
        let store: InMemoryCheckpointStore<String> = InMemoryCheckpointStore::new();
        let plan_id = Uuid::new_v4();

        store.persist(&checkpoint(plan_id, 1)).await.unwrap();
        store.persist(&checkpoint(plan_id, 2)).await.unwrap();

        let err = store.persist(&checkpoint(plan_id, 2)).await.unwrap_err();
        match err {
            ShardisError::Migration(e) => {
                assert_eq!(e.kind, MigrationErrorKind::CheckpointPersistFailed);
                assert_eq!(e.phase, MigrationPhase::Checkpoint);
            }
            other => panic!("unexpected error: {}", other),
        }

        let loaded = store.load(plan_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store: FileCheckpointStore<String> = FileCheckpointStore::new(dir.path());
        let plan_id = Uuid::new_v4();

        assert!(store.load(plan_id).await.unwrap().is_none());
        store.persist(&checkpoint(plan_id, 1)).await.unwrap();
        store.persist(&checkpoint(plan_id, 2)).await.unwrap();
        assert!(store.persist(&checkpoint(plan_id, 1)).await.is_err());

        let loaded = store.load(plan_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.last_processed_index, 1);
    }
}
