// Router - Resolves a key to a shard with sticky persisted assignment
// First resolution of a key creates the assignment; later calls return it

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::core::hashing::ShardKeyHasher;
use crate::core::strong_types::{Shard, ShardId, ShardKey, ShardKeyValue};
use crate::error::{RoutingError, ShardisResult};
use crate::infrastructure::monitoring::{metrics, MetricsCollector, METRIC_ROUTE_LATENCY};
use crate::infrastructure::shard_map::ShardMapStore;

/// Counter for first-time assignments, one increment per key lifecycle
pub const METRIC_ROUTE_MISS: &str = "shardis.route.miss";

/// Outcome of a route call
#[derive(Debug, Clone)]
pub struct RouteResolution {
    pub shard: Shard,
    /// `true` when the assignment already existed in the shard map
    pub existing: bool,
}

/// Shared resolution contract for the modulo and consistent-hash routers
#[async_trait]
pub trait ShardRouter<K: ShardKeyValue>: Send + Sync {
    async fn route(&self, key: &ShardKey<K>) -> ShardisResult<RouteResolution>;

    /// Number of currently registered shards
    async fn shard_count(&self) -> usize;
}

/// Router statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub resolutions: u64,
    pub existing_hits: u64,
    pub misses_recorded: u64,
    pub reroutes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    resolutions: AtomicU64,
    existing_hits: AtomicU64,
    misses_recorded: AtomicU64,
    reroutes: AtomicU64,
}

impl RouterCounters {
    pub(crate) fn resolution(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn existing_hit(&self) {
        self.existing_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self, collector: &MetricsCollector) {
        self.misses_recorded.fetch_add(1, Ordering::Relaxed);
        collector.increment_counter(METRIC_ROUTE_MISS, 1);
    }

    pub(crate) fn reroute(&self) {
        self.reroutes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RouterStats {
        RouterStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            existing_hits: self.existing_hits.load(Ordering::Relaxed),
            misses_recorded: self.misses_recorded.load(Ordering::Relaxed),
            reroutes: self.reroutes.load(Ordering::Relaxed),
        }
    }
}

/// Striped per-key locks serialising the assignment-creation path so racing
/// callers for the same key do not record duplicate misses.
pub(crate) struct StripedLocks {
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl StripedLocks {
    pub(crate) fn new(stripe_count: usize) -> Self {
        Self {
            stripes: (0..stripe_count.max(1))
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    pub(crate) fn stripe(&self, key_hash: u32) -> &tokio::sync::Mutex<()> {
        &self.stripes[key_hash as usize % self.stripes.len()]
    }
}

pub(crate) fn emit_route_observation(
    collector: &MetricsCollector,
    router: &'static str,
    key_hash: u32,
    shard_count: usize,
    resolution: &RouteResolution,
    started: Instant,
) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    collector.record_histogram(METRIC_ROUTE_LATENCY, elapsed_ms);
    debug!(
        target: "Shardis",
        router = router,
        key_hash = %format!("{:08x}", key_hash),
        shard_count = shard_count,
        assignment_existing = resolution.existing,
        shard_id = %resolution.shard.id,
        route_latency_ms = elapsed_ms,
        "route resolved"
    );
}

pub(crate) fn ensure_unique_shards(shards: &[Shard]) -> Result<(), RoutingError> {
    let mut seen = HashMap::new();
    for shard in shards {
        if seen.insert(shard.id.clone(), ()).is_some() {
            return Err(RoutingError::duplicate_shard_id(shard.id.clone()));
        }
    }
    Ok(())
}

const CREATION_LOCK_STRIPES: usize = 64;

/// Modulo router: `index = key_hash mod shard_count` over an
/// insertion-ordered shard list.
pub struct ModuloShardRouter<K: ShardKeyValue> {
    shards: Vec<Shard>,
    by_id: HashMap<ShardId, Shard>,
    store: Arc<dyn ShardMapStore<K>>,
    hasher: Arc<dyn ShardKeyHasher<K>>,
    creation_locks: StripedLocks,
    counters: RouterCounters,
    metrics: Arc<MetricsCollector>,
}

impl<K: ShardKeyValue> std::fmt::Debug for ModuloShardRouter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuloShardRouter").finish_non_exhaustive()
    }
}

impl<K: ShardKeyValue> ModuloShardRouter<K> {
    pub fn new(
        shards: Vec<Shard>,
        store: Arc<dyn ShardMapStore<K>>,
        hasher: Arc<dyn ShardKeyHasher<K>>,
    ) -> ShardisResult<Self> {
        ensure_unique_shards(&shards)?;
        let by_id = shards
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        Ok(Self {
            shards,
            by_id,
            store,
            hasher,
            creation_locks: StripedLocks::new(CREATION_LOCK_STRIPES),
            counters: RouterCounters::default(),
            metrics: metrics(),
        })
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    fn shard_for_hash(&self, key_hash: u32) -> &Shard {
        &self.shards[key_hash as usize % self.shards.len()]
    }

    async fn resolve(&self, key: &ShardKey<K>, key_hash: u32) -> ShardisResult<RouteResolution> {
        if self.shards.is_empty() {
            return Err(RoutingError::empty_ring(key_hash).into());
        }

        if let Some(assigned) = self.store.try_get(key).await? {
            return self.resolve_assigned(key, key_hash, assigned).await;
        }

        // Serialise creation per key so racing callers record one miss
        let _guard = self.creation_locks.stripe(key_hash).lock().await;
        if let Some(assigned) = self.store.try_get(key).await? {
            return self.resolve_assigned(key, key_hash, assigned).await;
        }

        let candidate = self.shard_for_hash(key_hash).clone();
        let outcome = self.store.try_assign(key, &candidate.id).await?;
        if outcome.created {
            self.counters.miss(&self.metrics);
            Ok(RouteResolution {
                shard: candidate,
                existing: false,
            })
        } else {
            // Lost an out-of-process race; the stored mapping wins
            self.resolve_assigned(key, key_hash, outcome.mapping.shard_id)
                .await
        }
    }

    async fn resolve_assigned(
        &self,
        key: &ShardKey<K>,
        key_hash: u32,
        assigned: ShardId,
    ) -> ShardisResult<RouteResolution> {
        if let Some(shard) = self.by_id.get(&assigned) {
            self.counters.existing_hit();
            return Ok(RouteResolution {
                shard: shard.clone(),
                existing: true,
            });
        }

        // Stored mapping references a shard that is no longer registered:
        // re-resolve and overwrite, reporting a new assignment.
        let replacement = self.shard_for_hash(key_hash).clone();
        self.store.assign(key, &replacement.id).await?;
        self.counters.reroute();
        debug!(
            target: "Shardis",
            shard_id = %assigned,
            replacement_id = %replacement.id,
            "stored mapping referenced unknown shard, re-resolved"
        );
        Ok(RouteResolution {
            shard: replacement,
            existing: false,
        })
    }
}

#[async_trait]
impl<K: ShardKeyValue> ShardRouter<K> for ModuloShardRouter<K> {
    async fn route(&self, key: &ShardKey<K>) -> ShardisResult<RouteResolution> {
        let started = Instant::now();
        let key_hash = self.hasher.hash_key(key);
        self.counters.resolution();
        let resolution = self.resolve(key, key_hash).await?;
        emit_route_observation(
            &self.metrics,
            "modulo",
            key_hash,
            self.shards.len(),
            &resolution,
            started,
        );
        Ok(resolution)
    }

    async fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hashing::default_key_hasher;
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

    #[tokio::test]
    async fn test_route_is_sticky() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        let router = ModuloShardRouter::new(shards(4), store, default_key_hasher()).unwrap();

        let first = router.route(&key("user-1")).await.unwrap();
        assert!(!first.existing);
        for _ in 0..10 {
            let again = router.route(&key("user-1")).await.unwrap();
            assert!(again.existing);
            assert_eq!(again.shard.id, first.shard.id);
        }
        assert_eq!(router.stats().misses_recorded, 1);
    }

    #[tokio::test]
    async fn test_duplicate_shard_id_rejected() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        let mut list = shards(2);
        list.push(Shard::new("s1", "mem://dup"));
        let err = ModuloShardRouter::new(list, store, default_key_hasher()).unwrap_err();
        match err {
            ShardisError::Routing(e) => {
                assert_eq!(e.kind, RoutingErrorKind::DuplicateShardId);
                assert_eq!(e.shard_id, Some(ShardId::new("s1")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_router_errors() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        let router = ModuloShardRouter::new(Vec::new(), store, default_key_hasher()).unwrap();
        let err = router.route(&key("user-1")).await.unwrap_err();
        match err {
            ShardisError::Routing(e) => assert_eq!(e.kind, RoutingErrorKind::EmptyRing),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_assignment_rerouted() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        store
            .assign(&key("user-1"), &ShardId::new("gone"))
            .await
            .unwrap();
        let router =
            ModuloShardRouter::new(shards(2), Arc::clone(&store) as _, default_key_hasher())
                .unwrap();

        let resolved = router.route(&key("user-1")).await.unwrap();
        assert!(!resolved.existing);
        assert_ne!(resolved.shard.id, ShardId::new("gone"));
        assert_eq!(router.stats().reroutes, 1);

        let mapped = store.try_get(&key("user-1")).await.unwrap().unwrap();
        assert_eq!(mapped, resolved.shard.id);
    }

    #[tokio::test]
    async fn test_concurrent_first_route_records_single_miss() {
        let store: Arc<InMemoryShardMapStore<String>> = Arc::new(InMemoryShardMapStore::new());
        let router =
            Arc::new(ModuloShardRouter::new(shards(4), store, default_key_hasher()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(
                async move { router.route(&key("hot")).await },
            ));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().shard.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(router.stats().misses_recorded, 1);
    }
}
