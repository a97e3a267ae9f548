// Data Mover and Map Swapper - Per-key copy/verify and batched map flips
// Storage drivers implement these; the in-memory mover backs the test suite
// and the full-equality verification strategy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::strong_types::{ShardId, ShardKey, ShardKeyValue};
use crate::error::{ShardisResult, StoreError};
use crate::infrastructure::migration::plan::KeyMove;
use crate::infrastructure::shard_map::ShardMapStore;

/// An entity as stored on a shard: opaque payload plus an optional
/// engine-provided version token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntity {
    pub data: Vec<u8>,
    pub row_version: Option<Vec<u8>>,
}

impl ShardEntity {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            row_version: None,
        }
    }

    pub fn with_row_version(mut self, token: Vec<u8>) -> Self {
        self.row_version = Some(token);
        self
    }
}

/// Copies and verifies one key between shards.
/// `copy` is a no-op when the source entity is missing; `verify` returns
/// false when either side is missing or the sides differ.
#[async_trait]
pub trait DataMover<K: ShardKeyValue>: Send + Sync {
    async fn copy(&self, mv: &KeyMove<K>) -> ShardisResult<()>;
    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool>;
}

/// Loads raw entities for verification strategies that compare both sides
#[async_trait]
pub trait EntityReader<K: ShardKeyValue>: Send + Sync {
    async fn load(
        &self,
        shard_id: &ShardId,
        key: &ShardKey<K>,
    ) -> ShardisResult<Option<ShardEntity>>;
}

/// Applies a batch of verified moves to the shard map. Implementations aim
/// for all-or-nothing semantics; where that is impossible they must be
/// idempotent so the whole batch can be re-issued.
#[async_trait]
pub trait MapSwapper<K: ShardKeyValue>: Send + Sync {
    async fn swap(&self, batch: &[KeyMove<K>]) -> ShardisResult<()>;
}

/// In-memory mover over per-shard entity maps, with transient-fault injection
pub struct InMemoryDataMover<K: ShardKeyValue> {
    shards: RwLock<HashMap<ShardId, HashMap<ShardKey<K>, ShardEntity>>>,
    copy_faults: RwLock<HashMap<ShardKey<K>, u32>>,
    verify_faults: RwLock<HashMap<ShardKey<K>, u32>>,
    op_delay: Option<std::time::Duration>,
}

impl<K: ShardKeyValue> InMemoryDataMover<K> {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            copy_faults: RwLock::new(HashMap::new()),
            verify_faults: RwLock::new(HashMap::new()),
            op_delay: None,
        }
    }

    /// Sleep before each copy/verify, simulating per-operation I/O latency
    pub fn with_op_delay(mut self, delay: std::time::Duration) -> Self {
        self.op_delay = Some(delay);
        self
    }

    pub async fn seed(&self, shard_id: &ShardId, key: &ShardKey<K>, entity: ShardEntity) {
        let mut shards = self.shards.write().await;
        shards
            .entry(shard_id.clone())
            .or_default()
            .insert(key.clone(), entity);
    }

    pub async fn entity(&self, shard_id: &ShardId, key: &ShardKey<K>) -> Option<ShardEntity> {
        let shards = self.shards.read().await;
        shards.get(shard_id).and_then(|m| m.get(key)).cloned()
    }

    /// Overwrite the target-side entity, simulating post-copy drift
    pub async fn corrupt(&self, shard_id: &ShardId, key: &ShardKey<K>, entity: ShardEntity) {
        self.seed(shard_id, key, entity).await;
    }

    /// Make the next `times` copy attempts for `key` fail transiently
    pub async fn fail_copy(&self, key: &ShardKey<K>, times: u32) {
        self.copy_faults.write().await.insert(key.clone(), times);
    }

    /// Make the next `times` verify attempts for `key` fail transiently
    pub async fn fail_verify(&self, key: &ShardKey<K>, times: u32) {
        self.verify_faults.write().await.insert(key.clone(), times);
    }

    async fn consume_fault(
        faults: &RwLock<HashMap<ShardKey<K>, u32>>,
        key: &ShardKey<K>,
    ) -> bool {
        let mut faults = faults.write().await;
        match faults.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl<K: ShardKeyValue> Default for InMemoryDataMover<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: ShardKeyValue> DataMover<K> for InMemoryDataMover<K> {
    async fn copy(&self, mv: &KeyMove<K>) -> ShardisResult<()> {
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::consume_fault(&self.copy_faults, &mv.key).await {
            return Err(StoreError::connectivity(
                format!("injected copy fault for {}", mv.key),
                anyhow::anyhow!("transient I/O error"),
            )
            .into());
        }

        let mut shards = self.shards.write().await;
        let entity = shards
            .get(&mv.source)
            .and_then(|m| m.get(&mv.key))
            .cloned();
        // Missing source is a no-op by contract
        if let Some(entity) = entity {
            shards
                .entry(mv.target.clone())
                .or_default()
                .insert(mv.key.clone(), entity);
        }
        Ok(())
    }

    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool> {
        if let Some(delay) = self.op_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::consume_fault(&self.verify_faults, &mv.key).await {
            return Err(StoreError::connectivity(
                format!("injected verify fault for {}", mv.key),
                anyhow::anyhow!("transient I/O error"),
            )
            .into());
        }

        let shards = self.shards.read().await;
        let source = shards.get(&mv.source).and_then(|m| m.get(&mv.key));
        let target = shards.get(&mv.target).and_then(|m| m.get(&mv.key));
        Ok(match (source, target) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }
}

#[async_trait]
impl<K: ShardKeyValue> EntityReader<K> for InMemoryDataMover<K> {
    async fn load(
        &self,
        shard_id: &ShardId,
        key: &ShardKey<K>,
    ) -> ShardisResult<Option<ShardEntity>> {
        Ok(self.entity(shard_id, key).await)
    }
}

/// Swapper applying each verified move through the shard map store's
/// unconditional `assign`, which makes re-issued batches idempotent.
pub struct MapStoreSwapper<K: ShardKeyValue> {
    store: Arc<dyn ShardMapStore<K>>,
}

impl<K: ShardKeyValue> MapStoreSwapper<K> {
    pub fn new(store: Arc<dyn ShardMapStore<K>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<K: ShardKeyValue> MapSwapper<K> for MapStoreSwapper<K> {
    async fn swap(&self, batch: &[KeyMove<K>]) -> ShardisResult<()> {
        for mv in batch {
            self.store.assign(&mv.key, &mv.target).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::shard_map::InMemoryShardMapStore;

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    fn mv(k: &str) -> KeyMove<String> {
        KeyMove::new(key(k), ShardId::new("A"), ShardId::new("B"))
    }

    #[tokio::test]
    async fn test_copy_then_verify() {
        let mover = InMemoryDataMover::new();
        mover
            .seed(&ShardId::new("A"), &key("k1"), ShardEntity::new(b"v1".to_vec()))
            .await;

        assert!(!mover.verify(&mv("k1")).await.unwrap());
        mover.copy(&mv("k1")).await.unwrap();
        assert!(mover.verify(&mv("k1")).await.unwrap());
        assert_eq!(
            mover.entity(&ShardId::new("B"), &key("k1")).await.unwrap().data,
            b"v1".to_vec()
        );
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_noop() {
        let mover: InMemoryDataMover<String> = InMemoryDataMover::new();
        mover.copy(&mv("ghost")).await.unwrap();
        assert!(mover.entity(&ShardId::new("B"), &key("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn test_fault_injection_is_transient() {
        let mover = InMemoryDataMover::new();
        mover
            .seed(&ShardId::new("A"), &key("k1"), ShardEntity::new(b"v".to_vec()))
            .await;
        mover.fail_copy(&key("k1"), 2).await;

        assert!(mover.copy(&mv("k1")).await.is_err());
        assert!(mover.copy(&mv("k1")).await.is_err());
        assert!(mover.copy(&mv("k1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_map_store_swapper_idempotent() {
        let store = Arc::new(InMemoryShardMapStore::new());
        store.assign(&key("k1"), &ShardId::new("A")).await.unwrap();
        let swapper = MapStoreSwapper::new(Arc::clone(&store) as Arc<dyn ShardMapStore<String>>);

        let batch = vec![mv("k1")];
        swapper.swap(&batch).await.unwrap();
        swapper.swap(&batch).await.unwrap();

        assert_eq!(
            store.try_get(&key("k1")).await.unwrap(),
            Some(ShardId::new("B"))
        );
    }
}
