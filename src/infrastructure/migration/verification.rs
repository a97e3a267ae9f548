// Verification Strategies - Post-copy comparison of source and target
// Full equality delegates to the mover; rowversion compares engine tokens;
// checksum hashes a canonical JSON projection of both sides.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::hashing::fnv1a_64;
use crate::core::strong_types::ShardKeyValue;
use crate::error::{ShardisResult, StoreError};
use crate::infrastructure::migration::mover::{DataMover, EntityReader};
use crate::infrastructure::migration::plan::KeyMove;

/// Compares the post-copy target state to the source for one key move
#[async_trait]
pub trait VerificationStrategy<K: ShardKeyValue>: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(true)` = match, `Ok(false)` = mismatch (permanent),
    /// `Err` = transient failure eligible for retry
    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool>;
}

/// Delegates to the mover's own comparison
pub struct FullEqualityVerification<K: ShardKeyValue> {
    mover: Arc<dyn DataMover<K>>,
}

impl<K: ShardKeyValue> FullEqualityVerification<K> {
    pub fn new(mover: Arc<dyn DataMover<K>>) -> Self {
        Self { mover }
    }
}

#[async_trait]
impl<K: ShardKeyValue> VerificationStrategy<K> for FullEqualityVerification<K> {
    fn name(&self) -> &'static str {
        "full-equality"
    }

    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool> {
        self.mover.verify(mv).await
    }
}

/// Both sides must exist and carry byte-identical non-null version tokens
pub struct RowVersionVerification<K: ShardKeyValue> {
    reader: Arc<dyn EntityReader<K>>,
}

impl<K: ShardKeyValue> RowVersionVerification<K> {
    pub fn new(reader: Arc<dyn EntityReader<K>>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<K: ShardKeyValue> VerificationStrategy<K> for RowVersionVerification<K> {
    fn name(&self) -> &'static str {
        "rowversion"
    }

    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool> {
        let source = self.reader.load(&mv.source, &mv.key).await?;
        let target = self.reader.load(&mv.target, &mv.key).await?;
        Ok(match (source, target) {
            (Some(a), Some(b)) => match (a.row_version, b.row_version) {
                (Some(va), Some(vb)) => va == vb,
                _ => false,
            },
            _ => false,
        })
    }
}

/// Canonical UTF-8 JSON with lexicographically ordered object properties
pub(crate) fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic projection applied before hashing; identity when absent
pub type ChecksumProjection = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Loads both entities as JSON, applies a deterministic projection,
/// canonicalises, and compares 64-bit FNV-1a checksums.
pub struct ChecksumVerification<K: ShardKeyValue> {
    reader: Arc<dyn EntityReader<K>>,
    projection: Option<ChecksumProjection>,
}

impl<K: ShardKeyValue> ChecksumVerification<K> {
    pub fn new(reader: Arc<dyn EntityReader<K>>) -> Self {
        Self {
            reader,
            projection: None,
        }
    }

    pub fn with_projection(mut self, projection: ChecksumProjection) -> Self {
        self.projection = Some(projection);
        self
    }

    async fn checksum(
        &self,
        shard: &crate::core::strong_types::ShardId,
        mv: &KeyMove<K>,
    ) -> ShardisResult<Option<u64>> {
        let Some(entity) = self.reader.load(shard, &mv.key).await? else {
            return Ok(None);
        };
        let value: Value = serde_json::from_slice(&entity.data).map_err(|e| {
            StoreError::serialization(format!(
                "entity for {} on {} is not valid JSON: {}",
                mv.key, shard, e
            ))
        })?;
        let value = match &self.projection {
            Some(projection) => projection(&value),
            None => value,
        };
        Ok(Some(fnv1a_64(canonical_json(&value).as_bytes())))
    }
}

#[async_trait]
impl<K: ShardKeyValue> VerificationStrategy<K> for ChecksumVerification<K> {
    fn name(&self) -> &'static str {
        "checksum"
    }

    async fn verify(&self, mv: &KeyMove<K>) -> ShardisResult<bool> {
        let source = self.checksum(&mv.source, mv).await?;
        let target = self.checksum(&mv.target, mv).await?;
        Ok(match (source, target) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strong_types::{ShardId, ShardKey};
    use crate::infrastructure::migration::mover::{InMemoryDataMover, ShardEntity};
    use serde_json::json;

    fn key(s: &str) -> ShardKey<String> {
        ShardKey::new(s.to_string())
    }

    fn mv(k: &str) -> KeyMove<String> {
        KeyMove::new(key(k), ShardId::new("A"), ShardId::new("B"))
    }

    #[test]
    fn test_canonical_json_orders_properties() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[tokio::test]
    async fn test_rowversion_requires_tokens_on_both_sides() {
        let mover = Arc::new(InMemoryDataMover::new());
        let strategy = RowVersionVerification::new(Arc::clone(&mover) as Arc<dyn EntityReader<String>>);

        mover
            .seed(
                &ShardId::new("A"),
                &key("k"),
                ShardEntity::new(b"v".to_vec()).with_row_version(vec![1, 2]),
            )
            .await;
        assert!(!strategy.verify(&mv("k")).await.unwrap());

        mover
            .seed(
                &ShardId::new("B"),
                &key("k"),
                ShardEntity::new(b"v".to_vec()).with_row_version(vec![1, 2]),
            )
            .await;
        assert!(strategy.verify(&mv("k")).await.unwrap());

        // Token missing on one side is a mismatch even with equal payloads
        mover
            .seed(&ShardId::new("B"), &key("k"), ShardEntity::new(b"v".to_vec()))
            .await;
        assert!(!strategy.verify(&mv("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_checksum_matches_despite_property_order() {
        let mover = Arc::new(InMemoryDataMover::new());
        let strategy = ChecksumVerification::new(Arc::clone(&mover) as Arc<dyn EntityReader<String>>);

        mover
            .seed(
                &ShardId::new("A"),
                &key("k"),
                ShardEntity::new(br#"{"name":"ada","age":37}"#.to_vec()),
            )
            .await;
        mover
            .seed(
                &ShardId::new("B"),
                &key("k"),
                ShardEntity::new(br#"{"age":37,"name":"ada"}"#.to_vec()),
            )
            .await;
        assert!(strategy.verify(&mv("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_checksum_projection_narrows_comparison() {
        let mover = Arc::new(InMemoryDataMover::new());
        mover
            .seed(
                &ShardId::new("A"),
                &key("k"),
                ShardEntity::new(br#"{"id":1,"updated":"2026-01-01"}"#.to_vec()),
            )
            .await;
        mover
            .seed(
                &ShardId::new("B"),
                &key("k"),
                ShardEntity::new(br#"{"id":1,"updated":"2026-02-02"}"#.to_vec()),
            )
            .await;

        let full = ChecksumVerification::new(Arc::clone(&mover) as Arc<dyn EntityReader<String>>);
        assert!(!full.verify(&mv("k")).await.unwrap());

        let projected = ChecksumVerification::new(Arc::clone(&mover) as Arc<dyn EntityReader<String>>)
            .with_projection(Arc::new(|v: &Value| json!({"id": v["id"].clone()})));
        assert!(projected.verify(&mv("k")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_side_is_mismatch() {
        let mover = Arc::new(InMemoryDataMover::new());
        let strategy = ChecksumVerification::new(Arc::clone(&mover) as Arc<dyn EntityReader<String>>);
        assert!(!strategy.verify(&mv("ghost")).await.unwrap());
    }
}
