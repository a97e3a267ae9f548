// Consistent Hash Ring - Virtual-node placement with bounded reshuffling
// Readers binary-search an atomically swapped sorted snapshot; topology
// changes rebuild the ring under a single writer lock.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::core::hashing::{virtual_node_id, RingHasher, ShardKeyHasher};
use crate::core::strong_types::{Shard, ShardId, ShardKey, ShardKeyValue};
use crate::error::{RoutingError, ShardisResult};
use crate::infrastructure::monitoring::{metrics, MetricsCollector};
use crate::infrastructure::router::{
    emit_route_observation, ensure_unique_shards, RouteResolution, RouterCounters, RouterStats,
    ShardRouter, StripedLocks,
};
use crate::infrastructure::shard_map::ShardMapStore;

pub const MIN_REPLICATION_FACTOR: u32 = 1;
pub const MAX_REPLICATION_FACTOR: u32 = 10_000;

const RESOLUTION_CACHE_CAPACITY: usize = 10_000;
const CREATION_LOCK_STRIPES: usize = 64;

/// Immutable sorted view of the ring. Lookups are O(log V).
#[derive(Debug)]
pub(crate) struct RingSnapshot {
    ring_keys: Vec<u32>,
    ring_shards: Vec<ShardId>,
    registry: HashMap<ShardId, Shard>,
}

impl RingSnapshot {
    fn build(shards: &[Shard], replication_factor: u32, hasher: &dyn RingHasher) -> Self {
        // (hash, insertion sequence, shard): sorting by sequence within equal
        // hashes makes collision handling first-winner deterministic.
        let mut entries: Vec<(u32, usize, ShardId)> = Vec::new();
        for (seq, shard) in shards.iter().enumerate() {
            for replica in 0..replication_factor {
                let vnode = virtual_node_id(shard.id.value(), replica);
                entries.push((hasher.hash_entry(&vnode), seq, shard.id.clone()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.dedup_by_key(|e| e.0);

        let mut ring_keys = Vec::with_capacity(entries.len());
        let mut ring_shards = Vec::with_capacity(entries.len());
        for (hash, _, shard_id) in entries {
            ring_keys.push(hash);
            ring_shards.push(shard_id);
        }

        Self {
            ring_keys,
            ring_shards,
            registry: shards.iter().map(|s| (s.id.clone(), s.clone())).collect(),
        }
    }

    /// Smallest ring key >= `hash`, wrapping to index 0 past the end
    fn lookup(&self, hash: u32) -> Option<&ShardId> {
        if self.ring_keys.is_empty() {
            return None;
        }
        let idx = self.ring_keys.partition_point(|k| *k < hash);
        let idx = if idx == self.ring_keys.len() { 0 } else { idx };
        Some(&self.ring_shards[idx])
    }

    fn shard(&self, id: &ShardId) -> Option<&Shard> {
        self.registry.get(id)
    }

    fn shard_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub(crate) fn virtual_node_count(&self) -> usize {
        self.ring_keys.len()
    }
}

/// Consistent-hash router. Key placement moves by roughly `1/(N+1)` of keys
/// when a shard joins a ring of N shards.
pub struct ConsistentHashShardRouter<K: ShardKeyValue> {
    snapshot: std::sync::RwLock<Arc<RingSnapshot>>,
    /// Insertion-ordered registration list; mutations serialise on this lock
    registered: tokio::sync::Mutex<Vec<Shard>>,
    replication_factor: u32,
    store: Arc<dyn ShardMapStore<K>>,
    key_hasher: Arc<dyn ShardKeyHasher<K>>,
    ring_hasher: Arc<dyn RingHasher>,
    resolution_cache: std::sync::Mutex<LruCache<ShardKey<K>, ShardId>>,
    creation_locks: StripedLocks,
    counters: RouterCounters,
    metrics: Arc<MetricsCollector>,
}

impl<K: ShardKeyValue> std::fmt::Debug for ConsistentHashShardRouter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHashShardRouter")
            .finish_non_exhaustive()
    }
}

impl<K: ShardKeyValue> ConsistentHashShardRouter<K> {
    pub fn new(
        shards: Vec<Shard>,
        replication_factor: u32,
        store: Arc<dyn ShardMapStore<K>>,
        key_hasher: Arc<dyn ShardKeyHasher<K>>,
        ring_hasher: Arc<dyn RingHasher>,
    ) -> ShardisResult<Self> {
        if !(MIN_REPLICATION_FACTOR..=MAX_REPLICATION_FACTOR).contains(&replication_factor) {
            return Err(RoutingError::replication_factor_out_of_range(replication_factor).into());
        }
        ensure_unique_shards(&shards)?;

        let snapshot = RingSnapshot::build(&shards, replication_factor, ring_hasher.as_ref());
        info!(
            "Built hash ring: {} shards, {} virtual nodes",
            shards.len(),
            snapshot.ring_keys.len()
        );
        Ok(Self {
            snapshot: std::sync::RwLock::new(Arc::new(snapshot)),
            registered: tokio::sync::Mutex::new(shards),
            replication_factor,
            store,
            key_hasher,
            ring_hasher,
            resolution_cache: std::sync::Mutex::new(LruCache::new(
                NonZeroUsize::new(RESOLUTION_CACHE_CAPACITY).unwrap(),
            )),
            creation_locks: StripedLocks::new(CREATION_LOCK_STRIPES),
            counters: RouterCounters::default(),
            metrics: metrics(),
        })
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    fn current_snapshot(&self) -> Arc<RingSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_snapshot(&self, next: RingSnapshot) {
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(next);
    }

    fn clear_cache(&self) {
        self.resolution_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn cache_get(&self, key: &ShardKey<K>) -> Option<ShardId> {
        self.resolution_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_put(&self, key: &ShardKey<K>, shard_id: &ShardId) {
        self.resolution_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(key.clone(), shard_id.clone());
    }

    /// Add a shard; the ring is rebuilt and the snapshot swapped atomically
    pub async fn add_shard(&self, shard: Shard) -> ShardisResult<()> {
        let mut registered = self.registered.lock().await;
        if registered.iter().any(|s| s.id == shard.id) {
            return Err(RoutingError::duplicate_shard_id(shard.id).into());
        }
        registered.push(shard.clone());
        let next =
            RingSnapshot::build(&registered, self.replication_factor, self.ring_hasher.as_ref());
        self.swap_snapshot(next);
        self.clear_cache();
        info!("Added shard {} to hash ring", shard.id);
        Ok(())
    }

    /// Remove a shard; keys mapped to it re-resolve on next access
    pub async fn remove_shard(&self, shard_id: &ShardId) -> ShardisResult<()> {
        let mut registered = self.registered.lock().await;
        let before = registered.len();
        registered.retain(|s| &s.id != shard_id);
        if registered.len() == before {
            warn!("Remove ignored: shard {} not registered", shard_id);
            return Ok(());
        }
        let next =
            RingSnapshot::build(&registered, self.replication_factor, self.ring_hasher.as_ref());
        self.swap_snapshot(next);
        self.clear_cache();
        warn!("Removed shard {} from hash ring", shard_id);
        Ok(())
    }

    fn ring_resolve(
        &self,
        snapshot: &RingSnapshot,
        key_hash: u32,
    ) -> ShardisResult<Shard> {
        let shard_id = snapshot
            .lookup(key_hash)
            .ok_or_else(|| RoutingError::empty_ring(key_hash))?;
        // Every ring entry points at a registered shard
        Ok(snapshot
            .shard(shard_id)
            .cloned()
            .ok_or_else(|| RoutingError::unknown_shard(shard_id.clone()))?)
    }

    async fn resolve(&self, key: &ShardKey<K>, key_hash: u32) -> ShardisResult<RouteResolution> {
        let snapshot = self.current_snapshot();

        if let Some(cached) = self.cache_get(key) {
            if let Some(shard) = snapshot.shard(&cached) {
                self.counters.existing_hit();
                return Ok(RouteResolution {
                    shard: shard.clone(),
                    existing: true,
                });
            }
        }

        if let Some(assigned) = self.store.try_get(key).await? {
            return self
                .resolve_assigned(key, key_hash, assigned, &snapshot)
                .await;
        }

        let _guard = self.creation_locks.stripe(key_hash).lock().await;
        if let Some(assigned) = self.store.try_get(key).await? {
            return self
                .resolve_assigned(key, key_hash, assigned, &snapshot)
                .await;
        }

        let candidate = self.ring_resolve(&snapshot, key_hash)?;
        let outcome = self.store.try_assign(key, &candidate.id).await?;
        if outcome.created {
            self.counters.miss(&self.metrics);
            self.cache_put(key, &candidate.id);
            Ok(RouteResolution {
                shard: candidate,
                existing: false,
            })
        } else {
            self.resolve_assigned(key, key_hash, outcome.mapping.shard_id, &snapshot)
                .await
        }
    }

    async fn resolve_assigned(
        &self,
        key: &ShardKey<K>,
        key_hash: u32,
        assigned: ShardId,
        snapshot: &RingSnapshot,
    ) -> ShardisResult<RouteResolution> {
        if let Some(shard) = snapshot.shard(&assigned) {
            self.counters.existing_hit();
            self.cache_put(key, &assigned);
            return Ok(RouteResolution {
                shard: shard.clone(),
                existing: true,
            });
        }

        // Assigned shard left the ring: re-resolve and persist the replacement
        let replacement = self.ring_resolve(snapshot, key_hash)?;
        self.store.assign(key, &replacement.id).await?;
        self.counters.reroute();
        self.cache_put(key, &replacement.id);
        debug!(
            target: "Shardis",
            shard_id = %assigned,
            replacement_id = %replacement.id,
            "assignment referenced removed shard, re-resolved via ring"
        );
        Ok(RouteResolution {
            shard: replacement,
            existing: false,
        })
    }
}

#[async_trait]
impl<K: ShardKeyValue> ShardRouter<K> for ConsistentHashShardRouter<K> {
    async fn route(&self, key: &ShardKey<K>) -> ShardisResult<RouteResolution> {
        let started = Instant::now();
        let key_hash = self.key_hasher.hash_key(key);
        self.counters.resolution();
        let shard_count = self.current_snapshot().shard_count();
        let resolution = self.resolve(key, key_hash).await?;
        emit_route_observation(
            &self.metrics,
            "consistent-hash",
            key_hash,
            shard_count,
            &resolution,
            started,
        );
        Ok(resolution)
    }

    async fn shard_count(&self) -> usize {
        self.current_snapshot().shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hashing::{default_key_hasher, default_ring_hasher};
    use crate::error::{RoutingErrorKind, ShardisError};
    use crate::infrastructure::shard_map::InMemoryShardMapStore;

    fn shards(n: usize) -> Vec<Shard> {
        (0..n)
            .map(|i| Shard::new(format!("s{}", i), format!("mem://s{}", i)))
            .collect()
    }

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    fn router(shards: Vec<Shard>, rf: u32) -> ConsistentHashShardRouter<String> {
        ConsistentHashShardRouter::new(
            shards,
            rf,
            Arc::new(InMemoryShardMapStore::new()),
            default_key_hasher(),
            default_ring_hasher(),
        )
        .unwrap()
    }

    #[test]
    fn test_replication_factor_bounds() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        for rf in [0_u32, 10_001] {
            let err = ConsistentHashShardRouter::new(
                shards(2),
                rf,
                Arc::clone(&store) as _,
                default_key_hasher(),
                default_ring_hasher(),
            )
            .unwrap_err();
            match err {
                ShardisError::Routing(e) => {
                    assert_eq!(e.kind, RoutingErrorKind::ReplicationFactorOutOfRange)
                }
                other => panic!("unexpected error: {}", other),
            }
        }
    }

    #[test]
    fn test_snapshot_lookup_wraps() {
        let snapshot = RingSnapshot::build(&shards(3), 64, &crate::core::hashing::Fnv1aHasher);
        assert!(snapshot.virtual_node_count() <= 3 * 64);
        // Larger than any ring key wraps to the first entry
        let wrapped = snapshot.lookup(u32::MAX).unwrap();
        let first = snapshot.lookup(0).unwrap();
        assert_eq!(wrapped, &snapshot.ring_shards[0].clone());
        assert!(snapshot.shard(first).is_some());
    }

    #[tokio::test]
    async fn test_route_deterministic_and_sticky() {
        let r = router(shards(4), 100);
        let first = r.route(&key("user-42")).await.unwrap();
        assert!(!first.existing);
        for _ in 0..5 {
            let again = r.route(&key("user-42")).await.unwrap();
            assert!(again.existing);
            assert_eq!(again.shard.id, first.shard.id);
        }
        assert_eq!(r.stats().misses_recorded, 1);
    }

    #[tokio::test]
    async fn test_empty_ring_after_removal() {
        let r = router(shards(1), 64);
        r.remove_shard(&ShardId::new("s0")).await.unwrap();
        let err = r.route(&key("user-1")).await.unwrap_err();
        match err {
            ShardisError::Routing(e) => {
                assert_eq!(e.kind, RoutingErrorKind::EmptyRing);
                assert_eq!(e.shard_count, Some(0));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_add_duplicate_shard_rejected() {
        let r = router(shards(2), 16);
        let err = r.add_shard(Shard::new("s1", "mem://dup")).await.unwrap_err();
        match err {
            ShardisError::Routing(e) => assert_eq!(e.kind, RoutingErrorKind::DuplicateShardId),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_removed_shard_reroutes_assignment() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        let r = ConsistentHashShardRouter::new(
            shards(3),
            64,
            Arc::clone(&store) as Arc<dyn ShardMapStore<String>>,
            default_key_hasher(),
            default_ring_hasher(),
        )
        .unwrap();

        let first = r.route(&key("user-7")).await.unwrap();
        r.remove_shard(&first.shard.id).await.unwrap();

        let second = r.route(&key("user-7")).await.unwrap();
        assert!(!second.existing);
        assert_ne!(second.shard.id, first.shard.id);
        let mapped = store.try_get(&key("user-7")).await.unwrap().unwrap();
        assert_eq!(mapped, second.shard.id);
    }

    #[tokio::test]
    async fn test_distribution_is_reasonable() {
        let r = router(shards(5), 100);
        let mut per_shard: HashMap<ShardId, usize> = HashMap::new();
        for i in 0..1000 {
            let resolved = r.route(&key(&format!("user-{}", i))).await.unwrap();
            *per_shard.entry(resolved.shard.id).or_insert(0) += 1;
        }
        for (shard, count) in per_shard {
            assert!(count < 600, "Shard {} has too many keys: {}", shard, count);
        }
    }
}
