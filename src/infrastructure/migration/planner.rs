// Migration Planner - Diffs two topology snapshots into an ordered move list
// Keys present in only one snapshot are not migrations: new keys are placed
// by the router on first access, deleted keys have nothing to move.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::strong_types::ShardKeyValue;
use crate::error::ShardisResult;
use crate::infrastructure::migration::plan::{KeyMove, MigrationPlan, TopologySnapshot};
use crate::infrastructure::shard_map::{EnumerableShardMapStore, ShardMapEntry};

pub const DEFAULT_SEGMENT_SIZE: usize = 10_000;

pub struct MigrationPlanner;

impl MigrationPlanner {
    /// Diff two materialised snapshots into a plan
    pub fn plan<K: ShardKeyValue>(
        from: &TopologySnapshot<K>,
        to: &TopologySnapshot<K>,
    ) -> MigrationPlan<K> {
        let mut moves = Vec::new();
        for (key, source) in from.iter() {
            if let Some(target) = to.get(key) {
                if target != source {
                    moves.push(KeyMove::new(key.clone(), source.clone(), target.clone()));
                }
            }
        }
        MigrationPlan::new(moves)
    }

    /// Diff a large shard map against a target snapshot without materialising
    /// the source: the store is streamed in segments of `segment_size`,
    /// bounding memory to `O(segment_size + moves)`. Produces the same plan
    /// ordering as [`plan`](Self::plan).
    pub async fn plan_segmented<K: ShardKeyValue>(
        store: &dyn EnumerableShardMapStore<K>,
        to: &TopologySnapshot<K>,
        segment_size: usize,
        cancel: &CancellationToken,
    ) -> ShardisResult<MigrationPlan<K>> {
        let segment_size = segment_size.max(1);
        let mut stream = store.enumerate(cancel).await?;
        let mut segment: Vec<ShardMapEntry<K>> = Vec::with_capacity(segment_size);
        let mut moves = Vec::new();

        while let Some(entry) = stream.next().await {
            segment.push(entry?);
            if segment.len() >= segment_size {
                Self::diff_segment(&mut moves, segment.drain(..), to);
            }
        }
        Self::diff_segment(&mut moves, segment.drain(..), to);

        Ok(MigrationPlan::new(moves))
    }

    fn diff_segment<K: ShardKeyValue>(
        moves: &mut Vec<KeyMove<K>>,
        segment: impl Iterator<Item = ShardMapEntry<K>>,
        to: &TopologySnapshot<K>,
    ) {
        for entry in segment {
            if let Some(target) = to.get(&entry.key) {
                if target != &entry.shard_id {
                    moves.push(KeyMove::new(entry.key, entry.shard_id, target.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strong_types::{ShardId, ShardKey};
    use crate::infrastructure::shard_map::{InMemoryShardMapStore, ShardMapStore};

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    #[test]
    fn test_basic_diff() {
        let from = TopologySnapshot::from_entries(vec![
            (key("k1"), ShardId::new("A")),
            (key("k2"), ShardId::new("A")),
            (key("k3"), ShardId::new("B")),
        ]);
        let to = TopologySnapshot::from_entries(vec![
            (key("k1"), ShardId::new("A")),
            (key("k2"), ShardId::new("B")),
            (key("k3"), ShardId::new("B")),
        ]);

        let plan = MigrationPlanner::plan(&from, &to);
        assert_eq!(plan.len(), 1);
        let mv = &plan.moves()[0];
        assert_eq!(mv.key, key("k2"));
        assert_eq!(mv.source, ShardId::new("A"));
        assert_eq!(mv.target, ShardId::new("B"));
    }

    #[test]
    fn test_keys_in_only_one_snapshot_ignored() {
        let from = TopologySnapshot::from_entries(vec![
            (key("removed"), ShardId::new("A")),
            (key("stays"), ShardId::new("A")),
        ]);
        let to = TopologySnapshot::from_entries(vec![
            (key("stays"), ShardId::new("B")),
            (key("added"), ShardId::new("C")),
        ]);

        let plan = MigrationPlanner::plan(&from, &to);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.moves()[0].key, key("stays"));
    }

    #[test]
    fn test_identical_snapshots_empty_plan() {
        let snapshot = TopologySnapshot::from_entries(vec![(key("k"), ShardId::new("A"))]);
        let plan = MigrationPlanner::plan(&snapshot, &snapshot.clone());
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_segmented_matches_materialised() {
        let store = InMemoryShardMapStore::new();
        let mut from_entries = Vec::new();
        for i in 0..100 {
            let k = key(&format!("key-{:03}", i));
            let shard = ShardId::new(if i % 2 == 0 { "A" } else { "B" });
            store.assign(&k, &shard).await.unwrap();
            from_entries.push((k, shard));
        }
        let from = TopologySnapshot::from_entries(from_entries.clone());
        // Move every key currently on A to C
        let to = TopologySnapshot::from_entries(from_entries.iter().map(|(k, s)| {
            let target = if s == &ShardId::new("A") {
                ShardId::new("C")
            } else {
                s.clone()
            };
            (k.clone(), target)
        }));

        let materialised = MigrationPlanner::plan(&from, &to);
        let segmented =
            MigrationPlanner::plan_segmented(&store, &to, 7, &CancellationToken::new())
                .await
                .unwrap();

        assert_eq!(materialised.len(), 50);
        assert_eq!(segmented.len(), materialised.len());
        let a: Vec<_> = materialised
            .moves()
            .iter()
            .map(|m| (m.key.clone(), m.source.clone(), m.target.clone()))
            .collect();
        let b: Vec<_> = segmented
            .moves()
            .iter()
            .map(|m| (m.key.clone(), m.source.clone(), m.target.clone()))
            .collect();
        assert_eq!(a, b);
    }
}
