// Core types and primitives

pub mod hashing;
pub mod strong_types;

pub use hashing::{
    default_key_hasher, default_ring_hasher, fnv1a_32, fnv1a_64, stable_key_hash64, Fnv1aHasher,
    RingHasher, ShardKeyHasher,
};
pub use strong_types::{Shard, ShardId, ShardKey, ShardKeyValue};
