// Fan-out query core

pub mod executor;
pub mod health_aware;
pub mod model;
pub mod provider;

pub use executor::{FanOutQueryExecutor, ShardQueryExecutor, ShardQueryResults};
pub use health_aware::{HealthAwareQueryExecutor, UnhealthyShardBehavior};
pub use model::{
    FailureMode, FilterOperator, FilterPredicate, JsonOrderKey, MergeStrategy, OrderBy,
    Projection, QueryModel, QueryOptions,
};
pub use provider::{InMemoryShardQueryProvider, ShardQueryProvider, ShardQuerySession};
