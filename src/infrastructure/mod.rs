// Core infrastructure modules
pub mod hash_ring; // Consistent-hash ring router
pub mod health; // Shard health policy
pub mod merge; // Unordered and ordered stream merges
pub mod migration; // Copy/verify/swap key migration
pub mod monitoring; // Metrics and tracing setup
pub mod query; // Fan-out query execution
pub mod router; // Router contract and modulo router
pub mod shard_map; // Shard map store
pub mod sqlite_store; // Durable SQLite stores

// Re-export core infrastructure components
pub use hash_ring::ConsistentHashShardRouter;
pub use health::{
    AlwaysHealthyProbe, HealthPolicy, HealthPolicyConfig, HealthProbe,
    ShardAvailabilityRequirement, ShardHealthReport, ShardHealthStatus,
};
pub use merge::{
    merge_ordered, merge_unordered, MergeObserver, MergeOptions, NoopMergeObserver,
    ShardStopReason, SortDirection,
};
pub use monitoring::{initialize_metrics_default, init_tracing, metrics, MetricsCollector};
pub use router::{ModuloShardRouter, RouteResolution, RouterStats, ShardRouter};
pub use shard_map::{
    try_get_or_add, AssignOutcome, AssignmentChangedHook, EnumerableShardMapStore,
    InMemoryShardMapStore, ShardMapEntry, ShardMapHistoryRecord, ShardMapStore,
};
pub use sqlite_store::{SqliteCheckpointStore, SqliteShardMapStore};
