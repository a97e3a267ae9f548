// Health-Aware Query Execution - Decorator filtering targets by shard health
// Wraps any executor; behaviour on unhealthy targets is configurable.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::strong_types::ShardId;
use crate::error::{InsufficientHealthyShardsError, ShardisResult};
use crate::infrastructure::health::{HealthPolicy, ShardAvailabilityRequirement};
use crate::infrastructure::monitoring::{metrics, MetricsCollector, METRIC_HEALTH_SHARD_SKIPPED};
use crate::infrastructure::query::executor::{ShardQueryExecutor, ShardQueryResults};
use crate::infrastructure::query::model::QueryModel;

/// What to do with targets the health policy reports as unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyShardBehavior {
    /// Query unhealthy shards anyway
    Include,
    /// Drop unhealthy shards, failing if the remainder violates the requirement
    Skip,
    /// Fail immediately when any target is unhealthy
    Quarantine,
}

/// Decorator applying a `ShardAvailabilityRequirement` before fan-out
pub struct HealthAwareQueryExecutor {
    inner: Arc<dyn ShardQueryExecutor>,
    policy: Arc<HealthPolicy>,
    requirement: ShardAvailabilityRequirement,
    behavior: UnhealthyShardBehavior,
    collector: Arc<MetricsCollector>,
}

impl HealthAwareQueryExecutor {
    pub fn new(
        inner: Arc<dyn ShardQueryExecutor>,
        policy: Arc<HealthPolicy>,
        requirement: ShardAvailabilityRequirement,
        behavior: UnhealthyShardBehavior,
    ) -> Self {
        Self {
            inner,
            policy,
            requirement,
            behavior,
            collector: metrics(),
        }
    }

    /// Effective targets of `model` against the inner executor's registry
    fn effective_targets(&self, model: &QueryModel) -> Vec<ShardId> {
        let registered = self.inner.registered_shards();
        match &model.target_shards {
            None => registered,
            Some(ids) if ids.is_empty() => registered,
            Some(ids) => {
                let valid: HashSet<&ShardId> = registered.iter().collect();
                let mut seen = HashSet::new();
                ids.iter()
                    .filter(|id| valid.contains(id) && seen.insert((*id).clone()))
                    .cloned()
                    .collect()
            }
        }
    }
}

#[async_trait]
impl ShardQueryExecutor for HealthAwareQueryExecutor {
    async fn execute(
        &self,
        model: &QueryModel,
        cancel: &CancellationToken,
    ) -> ShardisResult<ShardQueryResults> {
        let targets = self.effective_targets(model);
        let total = targets.len();
        let (healthy, unhealthy) = self.policy.classify_targets(&targets).await;

        match self.behavior {
            UnhealthyShardBehavior::Include => self.inner.execute(model, cancel).await,
            UnhealthyShardBehavior::Quarantine => {
                if !unhealthy.is_empty() {
                    return Err(InsufficientHealthyShardsError::new(
                        total,
                        healthy.len(),
                        unhealthy,
                        self.requirement,
                    )
                    .into());
                }
                self.inner.execute(model, cancel).await
            }
            UnhealthyShardBehavior::Skip => {
                if !self.requirement.is_satisfied(total, healthy.len()) {
                    return Err(InsufficientHealthyShardsError::new(
                        total,
                        healthy.len(),
                        unhealthy,
                        self.requirement,
                    )
                    .into());
                }
                if unhealthy.is_empty() {
                    return self.inner.execute(model, cancel).await;
                }
                self.collector
                    .increment_counter(METRIC_HEALTH_SHARD_SKIPPED, unhealthy.len() as u64);
                warn!(
                    target: "Shardis",
                    skipped = unhealthy.len(),
                    "skipping unhealthy shards for query"
                );
                let restricted = model.clone().where_shards(healthy);
                self.inner.execute(&restricted, cancel).await
            }
        }
    }

    fn registered_shards(&self) -> Vec<ShardId> {
        self.inner.registered_shards()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strong_types::Shard;
    use crate::error::ShardisError;
    use crate::infrastructure::health::{
        AlwaysHealthyProbe, HealthPolicyConfig, ShardHealthStatus,
    };
    use crate::infrastructure::query::executor::FanOutQueryExecutor;
    use crate::infrastructure::query::model::QueryOptions;
    use crate::infrastructure::query::provider::InMemoryShardQueryProvider;
    use futures::StreamExt;
    use serde_json::{json, Value};

    async fn setup(
        unhealthy: &[&str],
    ) -> (Arc<dyn ShardQueryExecutor>, Arc<HealthPolicy>) {
        let shards: Vec<Shard> = (0..3)
            .map(|i| Shard::new(format!("{}", i), format!("mem://{}", i)))
            .collect();
        let provider = Arc::new(InMemoryShardQueryProvider::new());
        for shard in &shards {
            provider
                .insert_rows(&shard.id, "users", vec![json!({"shard": shard.id.value()})])
                .await;
        }
        let executor = Arc::new(
            FanOutQueryExecutor::new(shards.clone(), provider, QueryOptions::default()).unwrap(),
        );
        let policy = Arc::new(HealthPolicy::new(
            shards,
            Arc::new(AlwaysHealthyProbe),
            HealthPolicyConfig::default(),
        ));
        for id in unhealthy {
            policy
                .set_status(&ShardId::new(*id), ShardHealthStatus::Unhealthy)
                .await;
        }
        (executor, policy)
    }

    #[tokio::test]
    async fn test_quarantine_fails_on_any_unhealthy() {
        let (inner, policy) = setup(&["1"]).await;
        let executor = HealthAwareQueryExecutor::new(
            inner,
            policy,
            ShardAvailabilityRequirement::AllShards,
            UnhealthyShardBehavior::Quarantine,
        );

        let err = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ShardisError::Health(e) => {
                assert_eq!(e.total, 3);
                assert_eq!(e.healthy, 2);
                assert_eq!(e.unhealthy_ids, vec![ShardId::new("1")]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_skip_with_satisfied_requirement() {
        let (inner, policy) = setup(&["1"]).await;
        let executor = HealthAwareQueryExecutor::new(
            inner,
            policy,
            ShardAvailabilityRequirement::AtLeast(2),
            UnhealthyShardBehavior::Skip,
        );

        let results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let rows: Vec<Value> = results.map(|r| r.unwrap()).collect().await;
        let mut seen: Vec<&str> = rows.iter().map(|r| r["shard"].as_str().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec!["0", "2"]);
    }

    #[tokio::test]
    async fn test_skip_violating_requirement_fails() {
        let (inner, policy) = setup(&["1"]).await;
        let executor = HealthAwareQueryExecutor::new(
            inner,
            policy,
            ShardAvailabilityRequirement::AllShards,
            UnhealthyShardBehavior::Skip,
        );

        let err = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShardisError::Health(_)));
    }

    #[tokio::test]
    async fn test_include_ignores_health() {
        let (inner, policy) = setup(&["1"]).await;
        let executor = HealthAwareQueryExecutor::new(
            inner,
            policy,
            ShardAvailabilityRequirement::AllShards,
            UnhealthyShardBehavior::Include,
        );

        let results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let rows: Vec<Value> = results.map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 3);
    }
}
