// Hashing - Deterministic key and ring hashes
// FNV-1a is used throughout: placement hashes must be identical across
// processes and platforms, which rules out the std SipHash-based hashers.

use std::sync::Arc;

use crate::core::strong_types::{ShardKey, ShardKeyValue};

const FNV32_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV32_PRIME: u32 = 0x01000193;

const FNV64_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV64_PRIME: u64 = 0x00000100000001b3;

/// 32-bit FNV-1a over a byte slice
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// 64-bit FNV-1a over a byte slice
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET_BASIS;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// 64-bit stable hash of a shard key's bytes, used for deterministic plan ordering
pub fn stable_key_hash64<K: ShardKeyValue>(key: &ShardKey<K>) -> u64 {
    fnv1a_64(&key.to_bytes())
}

/// Hashes a shard key to a 32-bit placement hash
pub trait ShardKeyHasher<K: ShardKeyValue>: Send + Sync {
    fn hash_key(&self, key: &ShardKey<K>) -> u32;
}

/// Hashes an arbitrary string (virtual-node identifiers) to a 32-bit ring position
pub trait RingHasher: Send + Sync {
    fn hash_entry(&self, entry: &str) -> u32;
}

/// Default FNV-1a 32-bit hasher, usable for both key and ring hashing
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aHasher;

impl<K: ShardKeyValue> ShardKeyHasher<K> for Fnv1aHasher {
    fn hash_key(&self, key: &ShardKey<K>) -> u32 {
        fnv1a_32(&key.to_bytes())
    }
}

impl RingHasher for Fnv1aHasher {
    fn hash_entry(&self, entry: &str) -> u32 {
        fnv1a_32(entry.as_bytes())
    }
}

/// Ring position identifier for virtual node `i` of a shard
pub fn virtual_node_id(shard_id: &str, replica: u32) -> String {
    format!("{}-replica-{}", shard_id, replica)
}

/// Default key hasher as a shareable trait object
pub fn default_key_hasher<K: ShardKeyValue>() -> Arc<dyn ShardKeyHasher<K>> {
    Arc::new(Fnv1aHasher)
}

/// Default ring hasher as a shareable trait object
pub fn default_ring_hasher() -> Arc<dyn RingHasher> {
    Arc::new(Fnv1aHasher)
}
