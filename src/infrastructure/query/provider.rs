// Query Provider - Per-shard session and execution seam
// Storage drivers implement these traits; the in-memory provider is the
// reference implementation and the workhorse of the test suite.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::strong_types::{Shard, ShardId};
use crate::error::{QueryError, ShardisResult};
use crate::infrastructure::merge::SortDirection;
use crate::infrastructure::query::model::{JsonOrderKey, QueryModel};

/// A live connection to one shard, created per query unless the executor is
/// configured to retain sessions.
#[async_trait]
pub trait ShardQuerySession: Send + Sync {
    /// Run the query and expose a lazy result stream
    async fn execute(
        &self,
        model: &QueryModel,
    ) -> ShardisResult<BoxStream<'static, ShardisResult<Value>>>;
}

/// Factory for per-shard sessions plus the provider identity tags
#[async_trait]
pub trait ShardQueryProvider: Send + Sync {
    /// Value of the `db.system` metric tag
    fn system(&self) -> &'static str;

    /// Value of the `provider` metric tag
    fn name(&self) -> &'static str;

    /// Whether sessions honour `QueryModel::order_by` with sorted output
    fn supports_ordered_merge(&self) -> bool {
        false
    }

    async fn open_session(&self, shard: &Shard) -> ShardisResult<Arc<dyn ShardQuerySession>>;
}

/// In-memory provider over JSON rows keyed by shard and source type
pub struct InMemoryShardQueryProvider {
    data: RwLock<HashMap<ShardId, HashMap<String, Vec<Value>>>>,
    fail_sessions: RwLock<HashSet<ShardId>>,
    fail_execution: RwLock<HashSet<ShardId>>,
    row_delay: Option<Duration>,
}

impl InMemoryShardQueryProvider {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            fail_sessions: RwLock::new(HashSet::new()),
            fail_execution: RwLock::new(HashSet::new()),
            row_delay: None,
        }
    }

    /// Sleep between rows, simulating per-row I/O suspension points
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    pub async fn insert_rows(
        &self,
        shard_id: &ShardId,
        source_type: impl Into<String>,
        rows: Vec<Value>,
    ) {
        let mut data = self.data.write().await;
        data.entry(shard_id.clone())
            .or_default()
            .entry(source_type.into())
            .or_default()
            .extend(rows);
    }

    /// Make `open_session` fail for a shard (connectivity fault injection)
    pub async fn fail_session_for(&self, shard_id: &ShardId) {
        self.fail_sessions.write().await.insert(shard_id.clone());
    }

    /// Make `execute` fail for a shard (mid-query fault injection)
    pub async fn fail_execution_for(&self, shard_id: &ShardId) {
        self.fail_execution.write().await.insert(shard_id.clone());
    }
}

impl Default for InMemoryShardQueryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardQueryProvider for InMemoryShardQueryProvider {
    fn system(&self) -> &'static str {
        "memory"
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn supports_ordered_merge(&self) -> bool {
        true
    }

    async fn open_session(&self, shard: &Shard) -> ShardisResult<Arc<dyn ShardQuerySession>> {
        if self.fail_sessions.read().await.contains(&shard.id) {
            return Err(QueryError::shard_execution_failed(
                shard.id.clone(),
                "session unavailable",
                None,
            )
            .into());
        }
        let rows = {
            let data = self.data.read().await;
            data.get(&shard.id).cloned().unwrap_or_default()
        };
        Ok(Arc::new(InMemorySession {
            shard_id: shard.id.clone(),
            rows,
            fail: self.fail_execution.read().await.contains(&shard.id),
            row_delay: self.row_delay,
        }))
    }
}

struct InMemorySession {
    shard_id: ShardId,
    rows: HashMap<String, Vec<Value>>,
    fail: bool,
    row_delay: Option<Duration>,
}

#[async_trait]
impl ShardQuerySession for InMemorySession {
    async fn execute(
        &self,
        model: &QueryModel,
    ) -> ShardisResult<BoxStream<'static, ShardisResult<Value>>> {
        if self.fail {
            return Err(QueryError::shard_execution_failed(
                self.shard_id.clone(),
                "execution failed",
                None,
            )
            .into());
        }

        let mut rows: Vec<Value> = self
            .rows
            .get(&model.source_type)
            .map(|rows| rows.iter().filter_map(|r| model.evaluate(r)).collect())
            .unwrap_or_default();

        if let Some(order_by) = &model.order_by {
            let field = order_by.field.clone();
            rows.sort_by(|a, b| {
                let ordering = JsonOrderKey::extract(a, &field).cmp(&JsonOrderKey::extract(b, &field));
                match order_by.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
        }

        let delay = self.row_delay;
        let stream = futures::stream::iter(rows.into_iter().map(Ok));
        let stream = match delay {
            Some(delay) => stream
                .then(move |row| async move {
                    tokio::time::sleep(delay).await;
                    row
                })
                .boxed(),
            None => stream.boxed(),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::query::model::FilterOperator;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_provider_filters_rows() {
        let provider = InMemoryShardQueryProvider::new();
        let shard = Shard::new("s1", "mem://s1");
        provider
            .insert_rows(
                &shard.id,
                "users",
                vec![
                    json!({"id": 1, "age": 20}),
                    json!({"id": 2, "age": 40}),
                ],
            )
            .await;

        let session = provider.open_session(&shard).await.unwrap();
        let model = QueryModel::new("users").filter("age", FilterOperator::Gt, json!(30));
        let rows: Vec<Value> = session
            .execute(&model)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(rows, vec![json!({"id": 2, "age": 40})]);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let provider = InMemoryShardQueryProvider::new();
        let shard = Shard::new("s1", "mem://s1");

        provider.fail_session_for(&shard.id).await;
        assert!(provider.open_session(&shard).await.is_err());
    }
}
