// Migration Plan - Immutable topology snapshots and ordered key moves

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::hashing::stable_key_hash64;
use crate::core::strong_types::{ShardId, ShardKey, ShardKeyValue};

/// Immutable `key -> shard` mapping used as planner input and output.
/// Copy-on-write: mutation produces a new snapshot.
#[derive(Debug, Clone)]
pub struct TopologySnapshot<K: ShardKeyValue> {
    entries: Arc<HashMap<ShardKey<K>, ShardId>>,
}

impl<K: ShardKeyValue> TopologySnapshot<K> {
    pub fn from_entries(entries: impl IntoIterator<Item = (ShardKey<K>, ShardId)>) -> Self {
        Self {
            entries: Arc::new(entries.into_iter().collect()),
        }
    }

    pub fn empty() -> Self {
        Self {
            entries: Arc::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &ShardKey<K>) -> Option<&ShardId> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShardKey<K>, &ShardId)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// New snapshot with one assignment changed
    pub fn with_assignment(&self, key: ShardKey<K>, shard_id: ShardId) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key, shard_id);
        Self {
            entries: Arc::new(entries),
        }
    }
}

/// A planned relocation of one key. Source and target always differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMove<K: ShardKeyValue> {
    pub key: ShardKey<K>,
    pub source: ShardId,
    pub target: ShardId,
}

impl<K: ShardKeyValue> KeyMove<K> {
    pub fn new(key: ShardKey<K>, source: ShardId, target: ShardId) -> Self {
        assert!(source != target, "Key move source and target must differ");
        Self {
            key,
            source,
            target,
        }
    }
}

/// Per-key migration progress. Monotonic except `Failed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMoveState {
    Planned,
    Copied,
    Verified,
    Swapped,
    Failed,
}

impl KeyMoveState {
    /// No further work will happen for this key
    pub fn is_terminal(self) -> bool {
        matches!(self, KeyMoveState::Swapped | KeyMoveState::Failed)
    }

    /// Copy has completed (possibly further along)
    pub fn copy_done(self) -> bool {
        matches!(
            self,
            KeyMoveState::Copied | KeyMoveState::Verified | KeyMoveState::Swapped
        )
    }

    /// Verify has completed (possibly further along)
    pub fn verify_done(self) -> bool {
        matches!(self, KeyMoveState::Verified | KeyMoveState::Swapped)
    }
}

/// Immutable, deterministically ordered set of key moves
#[derive(Debug, Clone)]
pub struct MigrationPlan<K: ShardKeyValue> {
    plan_id: Uuid,
    created_at_utc: DateTime<Utc>,
    moves: Arc<Vec<KeyMove<K>>>,
}

impl<K: ShardKeyValue> MigrationPlan<K> {
    /// Build a plan with a fresh id. Moves are sorted by
    /// `(source, target, stable key hash)` so planning is reproducible.
    pub fn new(moves: Vec<KeyMove<K>>) -> Self {
        Self::restore(Uuid::new_v4(), Utc::now(), moves)
    }

    /// Rebuild a plan with a known identity, e.g. when resuming
    pub fn restore(plan_id: Uuid, created_at_utc: DateTime<Utc>, mut moves: Vec<KeyMove<K>>) -> Self {
        moves.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| stable_key_hash64(&a.key).cmp(&stable_key_hash64(&b.key)))
        });
        Self {
            plan_id,
            created_at_utc,
            moves: Arc::new(moves),
        }
    }

    pub fn id(&self) -> Uuid {
        self.plan_id
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at_utc
    }

    pub fn moves(&self) -> &[KeyMove<K>] {
        &self.moves
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}
