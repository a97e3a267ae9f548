// Error surface - one base error carrying ordered diagnostic context
// Derived kinds add typed fields per component (routing, store, query, migration, health)

use std::fmt;

use uuid::Uuid;

use crate::core::strong_types::ShardId;
use crate::infrastructure::health::ShardAvailabilityRequirement;

pub type ShardisResult<T> = Result<T, ShardisError>;

/// Ordered key/value diagnostic context attached to every error.
/// Read-only for consumers; producers append as the error travels outward.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticContext {
    entries: Vec<(String, String)>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry. Insertion order is preserved for logging.
    pub fn push(&mut self, key: impl Into<String>, value: impl fmt::Display) {
        self.entries.push((key.into(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for DiagnosticContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.entries {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingErrorKind {
    EmptyRing,
    DuplicateShardId,
    ReplicationFactorOutOfRange,
    UnknownShard,
}

/// Router construction and resolution failures
#[derive(Debug)]
pub struct RoutingError {
    pub kind: RoutingErrorKind,
    pub shard_id: Option<ShardId>,
    pub key_hash: Option<u32>,
    pub shard_count: Option<usize>,
    pub context: DiagnosticContext,
}

impl RoutingError {
    pub fn empty_ring(key_hash: u32) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("key.hash", format!("{:08x}", key_hash));
        context.push("shard.count", 0);
        Self {
            kind: RoutingErrorKind::EmptyRing,
            shard_id: None,
            key_hash: Some(key_hash),
            shard_count: Some(0),
            context,
        }
    }

    pub fn duplicate_shard_id(shard_id: ShardId) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("shard.id", &shard_id);
        Self {
            kind: RoutingErrorKind::DuplicateShardId,
            shard_id: Some(shard_id),
            key_hash: None,
            shard_count: None,
            context,
        }
    }

    pub fn replication_factor_out_of_range(value: u32) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("replication.factor", value);
        Self {
            kind: RoutingErrorKind::ReplicationFactorOutOfRange,
            shard_id: None,
            key_hash: None,
            shard_count: None,
            context,
        }
    }

    pub fn unknown_shard(shard_id: ShardId) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("shard.id", &shard_id);
        Self {
            kind: RoutingErrorKind::UnknownShard,
            shard_id: Some(shard_id),
            key_hash: None,
            shard_count: None,
            context,
        }
    }
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RoutingErrorKind::EmptyRing => write!(f, "Routing error: ring has no shards")?,
            RoutingErrorKind::DuplicateShardId => {
                write!(f, "Routing error: duplicate shard id")?;
            }
            RoutingErrorKind::ReplicationFactorOutOfRange => {
                write!(f, "Routing error: replication factor outside [1, 10000]")?;
            }
            RoutingErrorKind::UnknownShard => {
                write!(f, "Routing error: mapping references unknown shard")?;
            }
        }
        if !self.context.is_empty() {
            write!(f, " ({})", self.context)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    AssignConflict,
    Connectivity,
    Serialization,
}

/// Shard-map and checkpoint store failures
#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub detail: String,
    pub source: Option<anyhow::Error>,
    pub context: DiagnosticContext,
}

impl StoreError {
    pub fn connectivity(detail: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind: StoreErrorKind::Connectivity,
            detail: detail.into(),
            source: Some(source),
            context: DiagnosticContext::new(),
        }
    }

    pub fn serialization(detail: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Serialization,
            detail: detail.into(),
            source: None,
            context: DiagnosticContext::new(),
        }
    }

    pub fn assign_conflict(detail: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::AssignConflict,
            detail: detail.into(),
            source: None,
            context: DiagnosticContext::new(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StoreErrorKind::AssignConflict => write!(f, "Store error: assign conflict"),
            StoreErrorKind::Connectivity => write!(f, "Store error: connectivity"),
            StoreErrorKind::Serialization => write!(f, "Store error: serialization"),
        }?;
        write!(f, ": {}", self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryErrorKind {
    ShardExecutionFailed { shard_id: ShardId },
    Canceled,
    Timeout,
}

/// Fan-out query failures
#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub detail: String,
    pub source: Option<anyhow::Error>,
    pub context: DiagnosticContext,
}

impl QueryError {
    pub fn shard_execution_failed(
        shard_id: ShardId,
        detail: impl Into<String>,
        source: Option<anyhow::Error>,
    ) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("shard.id", &shard_id);
        Self {
            kind: QueryErrorKind::ShardExecutionFailed { shard_id },
            detail: detail.into(),
            source,
            context,
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: QueryErrorKind::Canceled,
            detail: "query canceled".to_string(),
            source: None,
            context: DiagnosticContext::new(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Timeout,
            detail: detail.into(),
            source: None,
            context: DiagnosticContext::new(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            QueryErrorKind::ShardExecutionFailed { shard_id } => {
                write!(f, "Query error: shard {} execution failed", shard_id)?;
            }
            QueryErrorKind::Canceled => write!(f, "Query error: canceled")?,
            QueryErrorKind::Timeout => write!(f, "Query error: timeout")?,
        }
        write!(f, ": {}", self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Plan,
    Copy,
    Verify,
    Swap,
    Checkpoint,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationPhase::Plan => "plan",
            MigrationPhase::Copy => "copy",
            MigrationPhase::Verify => "verify",
            MigrationPhase::Swap => "swap",
            MigrationPhase::Checkpoint => "checkpoint",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorKind {
    CopyFailed,
    VerifyFailed,
    SwapFailed,
    CheckpointPersistFailed,
}

/// Key-migration pipeline failures
#[derive(Debug)]
pub struct MigrationError {
    pub kind: MigrationErrorKind,
    pub phase: MigrationPhase,
    pub attempt_count: u32,
    pub plan_id: Uuid,
    pub source_shard_id: Option<ShardId>,
    pub target_shard_id: Option<ShardId>,
    pub detail: String,
    pub source: Option<anyhow::Error>,
    pub context: DiagnosticContext,
}

impl MigrationError {
    pub fn new(
        kind: MigrationErrorKind,
        phase: MigrationPhase,
        plan_id: Uuid,
        detail: impl Into<String>,
    ) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("plan.id", plan_id);
        context.push("phase", phase);
        Self {
            kind,
            phase,
            attempt_count: 0,
            plan_id,
            source_shard_id: None,
            target_shard_id: None,
            detail: detail.into(),
            source: None,
            context,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self.context.push("attempt.count", attempts);
        self
    }

    pub fn with_shards(mut self, source: ShardId, target: ShardId) -> Self {
        self.context.push("source.shard", &source);
        self.context.push("target.shard", &target);
        self.source_shard_id = Some(source);
        self.target_shard_id = Some(target);
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            MigrationErrorKind::CopyFailed => "copy failed",
            MigrationErrorKind::VerifyFailed => "verify failed",
            MigrationErrorKind::SwapFailed => "swap failed",
            MigrationErrorKind::CheckpointPersistFailed => "checkpoint persist failed",
        };
        write!(
            f,
            "Migration error: {} (plan {}, phase {}): {}",
            what, self.plan_id, self.phase, self.detail
        )
    }
}

/// Raised when a health requirement rules out executing a query
#[derive(Debug)]
pub struct InsufficientHealthyShardsError {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy_ids: Vec<ShardId>,
    pub requirement: ShardAvailabilityRequirement,
    pub context: DiagnosticContext,
}

impl InsufficientHealthyShardsError {
    pub fn new(
        total: usize,
        healthy: usize,
        unhealthy_ids: Vec<ShardId>,
        requirement: ShardAvailabilityRequirement,
    ) -> Self {
        let mut context = DiagnosticContext::new();
        context.push("shard.total", total);
        context.push("shard.healthy", healthy);
        context.push("requirement", &requirement);
        Self {
            total,
            healthy,
            unhealthy_ids,
            requirement,
            context,
        }
    }
}

impl fmt::Display for InsufficientHealthyShardsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insufficient healthy shards: {} healthy of {} (requirement {}, unhealthy: [",
            self.healthy, self.total, self.requirement
        )?;
        for (i, id) in self.unhealthy_ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "])")
    }
}

/// Unified error type for all shardis operations
#[derive(Debug)]
pub enum ShardisError {
    Routing(RoutingError),
    Store(StoreError),
    Query(QueryError),
    Migration(MigrationError),
    Health(InsufficientHealthyShardsError),
}

impl ShardisError {
    /// Ordered diagnostic context of the underlying error, for structured logging
    pub fn context(&self) -> &DiagnosticContext {
        match self {
            ShardisError::Routing(e) => &e.context,
            ShardisError::Store(e) => &e.context,
            ShardisError::Query(e) => &e.context,
            ShardisError::Migration(e) => &e.context,
            ShardisError::Health(e) => &e.context,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            ShardisError::Query(QueryError {
                kind: QueryErrorKind::Canceled,
                ..
            })
        )
    }
}

impl fmt::Display for ShardisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardisError::Routing(e) => write!(f, "{}", e),
            ShardisError::Store(e) => write!(f, "{}", e),
            ShardisError::Query(e) => write!(f, "{}", e),
            ShardisError::Migration(e) => write!(f, "{}", e),
            ShardisError::Health(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ShardisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner = match self {
            ShardisError::Store(e) => e.source.as_ref(),
            ShardisError::Query(e) => e.source.as_ref(),
            ShardisError::Migration(e) => e.source.as_ref(),
            _ => None,
        };
        inner.map(|s| {
            let err: &(dyn std::error::Error + 'static) = s.as_ref();
            err
        })
    }
}

impl From<RoutingError> for ShardisError {
    fn from(e: RoutingError) -> Self {
        ShardisError::Routing(e)
    }
}

impl From<StoreError> for ShardisError {
    fn from(e: StoreError) -> Self {
        ShardisError::Store(e)
    }
}

impl From<QueryError> for ShardisError {
    fn from(e: QueryError) -> Self {
        ShardisError::Query(e)
    }
}

impl From<MigrationError> for ShardisError {
    fn from(e: MigrationError) -> Self {
        ShardisError::Migration(e)
    }
}

impl From<InsufficientHealthyShardsError> for ShardisError {
    fn from(e: InsufficientHealthyShardsError) -> Self {
        ShardisError::Health(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_context_preserves_order() {
        let mut ctx = DiagnosticContext::new();
        ctx.push("b", 2);
        ctx.push("a", 1);
        let keys: Vec<&str> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(ctx.get("a"), Some("1"));
    }

    #[test]
    fn test_empty_ring_context() {
        let err = RoutingError::empty_ring(0xdeadbeef);
        assert_eq!(err.kind, RoutingErrorKind::EmptyRing);
        assert_eq!(err.context.get("key.hash"), Some("deadbeef"));
        assert_eq!(err.shard_count, Some(0));
    }

    #[test]
    fn test_migration_error_display() {
        let plan_id = Uuid::new_v4();
        let err = MigrationError::new(
            MigrationErrorKind::CopyFailed,
            MigrationPhase::Copy,
            plan_id,
            "io unavailable",
        )
        .with_attempts(3);
        let text = format!("{}", err);
        assert!(text.contains("copy failed"));
        assert!(text.contains(&plan_id.to_string()));
        assert_eq!(err.attempt_count, 3);
    }
}
