// Strong Types - Newtype identifiers for shard routing
// Replaces primitive aliases with proper newtype patterns for compile-time safety

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

use uuid::Uuid;

/// Strongly-typed shard identifier - opaque, non-empty, ordered by its string form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "Shard id must be non-empty");
        Self(id)
    }

    /// Get the raw id value
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A registered shard: its identity plus the opaque handle session factories
/// use to open connections against the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub connection_string: String,
}

impl Shard {
    pub fn new(id: impl Into<ShardId>, connection_string: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connection_string: connection_string.into(),
        }
    }
}

/// Value types usable as shard keys. Implementations must produce stable,
/// platform-independent bytes: the same value yields the same bytes in every
/// process, forever.
pub trait ShardKeyValue: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Stable byte representation used for placement hashing.
    fn to_bytes(&self) -> Vec<u8>;

    /// Stable textual representation used in durable payloads.
    fn canonical_string(&self) -> String;

    /// Inverse of [`canonical_string`](Self::canonical_string).
    fn from_canonical(s: &str) -> Option<Self>
    where
        Self: Sized;
}

impl ShardKeyValue for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn canonical_string(&self) -> String {
        self.clone()
    }

    fn from_canonical(s: &str) -> Option<Self> {
        Some(s.to_string())
    }
}

impl ShardKeyValue for i64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn canonical_string(&self) -> String {
        self.to_string()
    }

    fn from_canonical(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl ShardKeyValue for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn canonical_string(&self) -> String {
        self.to_string()
    }

    fn from_canonical(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

impl ShardKeyValue for Uuid {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn canonical_string(&self) -> String {
        self.to_string()
    }

    fn from_canonical(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok()
    }
}

/// Strongly-typed shard key wrapping an application key value.
/// Two keys wrapping equal values are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardKey<K: ShardKeyValue>(K);

impl<K: ShardKeyValue> ShardKey<K> {
    pub fn new(value: K) -> Self {
        Self(value)
    }

    /// Get the wrapped key value
    pub fn value(&self) -> &K {
        &self.0
    }

    /// Stable byte representation of the wrapped value
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Stable textual representation of the wrapped value
    pub fn canonical_string(&self) -> String {
        self.0.canonical_string()
    }
}

impl<K: ShardKeyValue> fmt::Display for ShardKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.canonical_string())
    }
}

impl<K: ShardKeyValue> From<K> for ShardKey<K> {
    fn from(value: K) -> Self {
        Self::new(value)
    }
}
