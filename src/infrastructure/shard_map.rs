// Shard Map Store - Authoritative key-to-shard assignments
// Sticky assignments with atomic compare-and-set insert and append-only history

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::strong_types::{ShardId, ShardKey, ShardKeyValue};
use crate::error::{QueryError, ShardisResult};

/// A single `key -> shard` assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMapEntry<K: ShardKeyValue> {
    pub key: ShardKey<K>,
    pub shard_id: ShardId,
}

/// Append-only audit record for assignment changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMapHistoryRecord<K: ShardKeyValue> {
    pub key: ShardKey<K>,
    pub old_shard_id: Option<ShardId>,
    pub new_shard_id: ShardId,
    pub changed_at_utc: DateTime<Utc>,
}

/// Result of an atomic insert attempt. `created == true` iff the insert won;
/// otherwise `mapping` reflects the pre-existing assignment, never a stale one.
#[derive(Debug, Clone)]
pub struct AssignOutcome<K: ShardKeyValue> {
    pub created: bool,
    pub mapping: ShardMapEntry<K>,
}

/// Fired after a durable insert, for out-of-process cache invalidation
pub type AssignmentChangedHook<K> =
    Arc<dyn Fn(&ShardKey<K>, Option<&ShardId>, &ShardId) + Send + Sync>;

/// Persistent `key -> shard` assignment store.
/// `try_assign` must linearise against itself and against `try_get`, and be
/// idempotent under concurrent retries.
#[async_trait]
pub trait ShardMapStore<K: ShardKeyValue>: Send + Sync {
    /// Non-blocking lookup
    async fn try_get(&self, key: &ShardKey<K>) -> ShardisResult<Option<ShardId>>;

    /// Unconditional insert-or-overwrite. Reserved for tests and migration swap.
    async fn assign(&self, key: &ShardKey<K>, shard_id: &ShardId) -> ShardisResult<()>;

    /// Atomic compare-and-set insert
    async fn try_assign(
        &self,
        key: &ShardKey<K>,
        shard_id: &ShardId,
    ) -> ShardisResult<AssignOutcome<K>>;
}

/// Optional capability: sorted enumeration of all assignments.
/// Streams entries in ascending key-byte order and honours cancellation
/// between rows.
#[async_trait]
pub trait EnumerableShardMapStore<K: ShardKeyValue>: ShardMapStore<K> {
    async fn enumerate(
        &self,
        cancel: &CancellationToken,
    ) -> ShardisResult<BoxStream<'static, ShardisResult<ShardMapEntry<K>>>>;
}

/// Lookup then, if absent, resolve a candidate shard and attempt the insert.
/// The factory runs at most once per call; under a race the pre-existing
/// mapping wins and is returned.
pub async fn try_get_or_add<K, F>(
    store: &dyn ShardMapStore<K>,
    key: &ShardKey<K>,
    factory: F,
) -> ShardisResult<AssignOutcome<K>>
where
    K: ShardKeyValue,
    F: FnOnce() -> ShardisResult<ShardId>,
{
    if let Some(existing) = store.try_get(key).await? {
        return Ok(AssignOutcome {
            created: false,
            mapping: ShardMapEntry {
                key: key.clone(),
                shard_id: existing,
            },
        });
    }
    let candidate = factory()?;
    store.try_assign(key, &candidate).await
}

/// In-memory reference implementation with per-entry atomic insert
pub struct InMemoryShardMapStore<K: ShardKeyValue> {
    entries: RwLock<HashMap<ShardKey<K>, ShardId>>,
    history: RwLock<Vec<ShardMapHistoryRecord<K>>>,
    hook: std::sync::RwLock<Option<AssignmentChangedHook<K>>>,
}

impl<K: ShardKeyValue> InMemoryShardMapStore<K> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            hook: std::sync::RwLock::new(None),
        }
    }

    /// Install the assignment-changed hook. Replaces any previous hook.
    pub fn on_assignment_changed(&self, hook: AssignmentChangedHook<K>) {
        *self
            .hook
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(hook);
    }

    /// Snapshot of the audit trail, in insertion order
    pub async fn history(&self) -> Vec<ShardMapHistoryRecord<K>> {
        self.history.read().await.clone()
    }

    /// Number of live assignments
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn fire_hook(&self, key: &ShardKey<K>, old: Option<&ShardId>, new: &ShardId) {
        let hook = self
            .hook
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(key, old, new);
        }
    }
}

impl<K: ShardKeyValue> Default for InMemoryShardMapStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: ShardKeyValue> ShardMapStore<K> for InMemoryShardMapStore<K> {
    async fn try_get(&self, key: &ShardKey<K>) -> ShardisResult<Option<ShardId>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn assign(&self, key: &ShardKey<K>, shard_id: &ShardId) -> ShardisResult<()> {
        let old = {
            let mut entries = self.entries.write().await;
            let old = entries.insert(key.clone(), shard_id.clone());
            let mut history = self.history.write().await;
            history.push(ShardMapHistoryRecord {
                key: key.clone(),
                old_shard_id: old.clone(),
                new_shard_id: shard_id.clone(),
                changed_at_utc: Utc::now(),
            });
            old
        };
        self.fire_hook(key, old.as_ref(), shard_id);
        Ok(())
    }

    async fn try_assign(
        &self,
        key: &ShardKey<K>,
        shard_id: &ShardId,
    ) -> ShardisResult<AssignOutcome<K>> {
        let outcome = {
            let mut entries = self.entries.write().await;
            if let Some(existing) = entries.get(key) {
                AssignOutcome {
                    created: false,
                    mapping: ShardMapEntry {
                        key: key.clone(),
                        shard_id: existing.clone(),
                    },
                }
            } else {
                entries.insert(key.clone(), shard_id.clone());
                let mut history = self.history.write().await;
                history.push(ShardMapHistoryRecord {
                    key: key.clone(),
                    old_shard_id: None,
                    new_shard_id: shard_id.clone(),
                    changed_at_utc: Utc::now(),
                });
                AssignOutcome {
                    created: true,
                    mapping: ShardMapEntry {
                        key: key.clone(),
                        shard_id: shard_id.clone(),
                    },
                }
            }
        };
        if outcome.created {
            self.fire_hook(key, None, shard_id);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl<K: ShardKeyValue> EnumerableShardMapStore<K> for InMemoryShardMapStore<K> {
    async fn enumerate(
        &self,
        cancel: &CancellationToken,
    ) -> ShardisResult<BoxStream<'static, ShardisResult<ShardMapEntry<K>>>> {
        let mut items: Vec<ShardMapEntry<K>> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(key, shard_id)| ShardMapEntry {
                    key: key.clone(),
                    shard_id: shard_id.clone(),
                })
                .collect()
        };
        items.sort_by(|a, b| a.key.to_bytes().cmp(&b.key.to_bytes()));

        let token = cancel.clone();
        let stream = futures::stream::unfold(
            (items.into_iter(), token, false),
            |(mut iter, token, done)| async move {
                if done {
                    return None;
                }
                if token.is_cancelled() {
                    return Some((Err(QueryError::canceled().into()), (iter, token, true)));
                }
                iter.next().map(|entry| (Ok(entry), (iter, token, false)))
            },
        );
        Ok(stream.boxed())
    }
}
