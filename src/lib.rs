// Shardis - Horizontal partitioning toolkit
// Routing with sticky assignments, fan-out queries with streaming merges,
// and checkpointed copy/verify/swap key migration.

// Core types and primitives
pub mod core;

// Infrastructure - routing, health, merge, query, and migration components
pub mod infrastructure;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use crate::core::{Shard, ShardId, ShardKey, ShardKeyValue};
pub use config::ShardisConfig;
pub use error::{ShardisError, ShardisResult};
pub use infrastructure::{
    ConsistentHashShardRouter, HealthPolicy, HealthPolicyConfig, InMemoryShardMapStore,
    ModuloShardRouter, RouteResolution, ShardAvailabilityRequirement, ShardMapStore, ShardRouter,
};
pub use infrastructure::migration::{
    MigrationExecutor, MigrationOptions, MigrationPlan, MigrationPlanner, TopologySnapshot,
};
pub use infrastructure::query::{
    FanOutQueryExecutor, HealthAwareQueryExecutor, QueryModel, QueryOptions, ShardQueryExecutor,
    UnhealthyShardBehavior,
};
