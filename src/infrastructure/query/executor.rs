// Query Executor - Fans a query plan out across shards
// Normalises targets, acquires per-shard sessions, feeds the merge engine,
// and emits one metric observation per query.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::strong_types::{Shard, ShardId};
use crate::error::{QueryError, ShardisError, ShardisResult};
use crate::infrastructure::merge::{
    merge_ordered, merge_unordered, MergeObserver, MergeOptions, NoopMergeObserver,
};
use crate::infrastructure::monitoring::{metrics, MetricsCollector, METRIC_QUERY_MERGE_LATENCY};
use crate::infrastructure::query::model::{
    FailureMode, JsonOrderKey, MergeStrategy, OrderBy, QueryModel, QueryOptions,
};
use crate::infrastructure::query::provider::{ShardQueryProvider, ShardQuerySession};
use crate::infrastructure::router::ensure_unique_shards;

type CapturedFailures = Arc<Mutex<Vec<(ShardId, ShardisError)>>>;

/// Merged result stream plus the per-shard failures captured in best-effort
/// mode. In fail-fast mode the capture list stays empty and the first error
/// surfaces through the stream itself.
pub struct ShardQueryResults {
    stream: BoxStream<'static, ShardisResult<Value>>,
    captured: CapturedFailures,
}

impl std::fmt::Debug for ShardQueryResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardQueryResults").finish_non_exhaustive()
    }
}

impl ShardQueryResults {
    /// Per-shard failures captured so far, as displayable messages
    pub fn captured_failures(&self) -> Vec<(ShardId, String)> {
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, err)| (id.clone(), err.to_string()))
            .collect()
    }

    /// Drain the captured failures, transferring ownership to the caller
    pub fn take_captured_failures(&self) -> Vec<(ShardId, ShardisError)> {
        std::mem::take(
            &mut *self
                .captured
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl Stream for ShardQueryResults {
    type Item = ShardisResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.poll_next_unpin(cx)
    }
}

/// Fan-out execution contract consumed by hosts and by the health decorator
#[async_trait]
pub trait ShardQueryExecutor: Send + Sync {
    async fn execute(
        &self,
        model: &QueryModel,
        cancel: &CancellationToken,
    ) -> ShardisResult<ShardQueryResults>;

    /// Identifiers of all registered shards, in registration order
    fn registered_shards(&self) -> Vec<ShardId>;
}

struct QueryTags {
    db_system: &'static str,
    provider: &'static str,
    shard_count: usize,
    target_shard_count: usize,
    invalid_shard_count: usize,
    merge_strategy: &'static str,
    ordering_buffered: bool,
    fanout_concurrency: usize,
    channel_capacity: i64,
    failure_mode: &'static str,
    root_type: String,
}

/// Emits the per-query metric exactly once, when the merged stream terminates
/// or is dropped
struct QueryMetricsGuard {
    inner: BoxStream<'static, ShardisResult<Value>>,
    collector: Arc<MetricsCollector>,
    tags: Option<QueryTags>,
    started: Instant,
    status: &'static str,
    completed: bool,
    cancel: CancellationToken,
}

impl Stream for QueryMetricsGuard {
    type Item = ShardisResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Err(err))) => {
                this.status = if err.is_canceled() { "canceled" } else { "failed" };
            }
            Poll::Ready(None) => {
                this.completed = true;
            }
            _ => {}
        }
        polled
    }
}

impl Drop for QueryMetricsGuard {
    fn drop(&mut self) {
        let Some(tags) = self.tags.take() else {
            return;
        };
        let mut status = self.status;
        if !self.completed && status == "ok" && self.cancel.is_cancelled() {
            status = "canceled";
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.collector
            .record_histogram(METRIC_QUERY_MERGE_LATENCY, elapsed_ms);
        debug!(
            target: "Shardis",
            db_system = tags.db_system,
            provider = tags.provider,
            shard_count = tags.shard_count,
            target_shard_count = tags.target_shard_count,
            invalid_shard_count = tags.invalid_shard_count,
            merge_strategy = tags.merge_strategy,
            ordering_buffered = tags.ordering_buffered,
            fanout_concurrency = tags.fanout_concurrency,
            channel_capacity = tags.channel_capacity,
            failure_mode = tags.failure_mode,
            result_status = status,
            root_type = %tags.root_type,
            query_latency_ms = elapsed_ms,
            "query completed"
        );
    }
}

/// Fans a `QueryModel` out to the targeted shards and merges the streams
pub struct FanOutQueryExecutor {
    shards: Vec<Shard>,
    by_id: HashMap<ShardId, Shard>,
    provider: Arc<dyn ShardQueryProvider>,
    options: QueryOptions,
    session_cache: Arc<RwLock<HashMap<ShardId, Arc<dyn ShardQuerySession>>>>,
    observer: Arc<dyn MergeObserver>,
    collector: Arc<MetricsCollector>,
}

impl FanOutQueryExecutor {
    pub fn new(
        shards: Vec<Shard>,
        provider: Arc<dyn ShardQueryProvider>,
        options: QueryOptions,
    ) -> ShardisResult<Self> {
        ensure_unique_shards(&shards)?;
        let by_id = shards.iter().map(|s| (s.id.clone(), s.clone())).collect();
        Ok(Self {
            shards,
            by_id,
            provider,
            options,
            session_cache: Arc::new(RwLock::new(HashMap::new())),
            observer: Arc::new(NoopMergeObserver),
            collector: metrics(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn MergeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Registered shards in registration order
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Drop all cached sessions (only populated when
    /// `dispose_session_per_query` is false)
    pub async fn clear_session_cache(&self) {
        self.session_cache.write().await.clear();
    }

    fn normalize_targets(&self, model: &QueryModel) -> (Vec<Shard>, usize) {
        match &model.target_shards {
            None => (self.shards.clone(), 0),
            Some(ids) if ids.is_empty() => (self.shards.clone(), 0),
            Some(ids) => {
                let mut targets = Vec::new();
                let mut seen = HashSet::new();
                let mut invalid = 0;
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    match self.by_id.get(id) {
                        Some(shard) => targets.push(shard.clone()),
                        None => invalid += 1,
                    }
                }
                (targets, invalid)
            }
        }
    }

    fn shard_stream(
        &self,
        shard: &Shard,
        model: &QueryModel,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, ShardisResult<Value>> {
        let provider = Arc::clone(&self.provider);
        let shard = shard.clone();
        let model = model.clone();
        let cancel = cancel.clone();
        let timeout = self.options.per_shard_command_timeout;
        let dispose = self.options.dispose_session_per_query;
        let cache = Arc::clone(&self.session_cache);

        let open_and_run = async move {
            let work = async {
                let session = if dispose {
                    provider
                        .open_session(&shard)
                        .await
                        .map_err(|e| wrap_shard_error(&shard.id, e))?
                } else {
                    let cached = cache.read().await.get(&shard.id).cloned();
                    match cached {
                        Some(session) => session,
                        None => {
                            let session = provider
                                .open_session(&shard)
                                .await
                                .map_err(|e| wrap_shard_error(&shard.id, e))?;
                            cache
                                .write()
                                .await
                                .insert(shard.id.clone(), Arc::clone(&session));
                            session
                        }
                    }
                };

                let rows = session
                    .execute(&model)
                    .await
                    .map_err(|e| wrap_shard_error(&shard.id, e))?;

                // The session must outlive the stream; sessions are released
                // when the last stream item is consumed or the query unwinds.
                let keeper = session;
                let rows = rows.map(move |item| {
                    let _session = &keeper;
                    item
                });

                let rows: BoxStream<'static, ShardisResult<Value>> = match timeout {
                    Some(limit) => {
                        let shard_id = shard.id.clone();
                        tokio_stream::StreamExt::timeout(rows, limit)
                            .map(move |item| match item {
                                Ok(inner) => inner,
                                Err(_) => Err(QueryError::timeout(format!(
                                    "shard {} exceeded per-shard timeout {:?}",
                                    shard_id, limit
                                ))
                                .into()),
                            })
                            .boxed()
                    }
                    None => rows.boxed(),
                };
                Ok::<_, ShardisError>(rows)
            };

            tokio::select! {
                _ = cancel.cancelled() => Err(QueryError::canceled().into()),
                result = work => result,
            }
        };

        futures::stream::once(open_and_run).try_flatten().boxed()
    }

    fn capture_errors(
        stream: BoxStream<'static, ShardisResult<Value>>,
        shard_id: ShardId,
        captured: CapturedFailures,
    ) -> BoxStream<'static, ShardisResult<Value>> {
        stream
            .scan((), move |_, item| {
                futures::future::ready(match item {
                    Ok(value) => Some(Ok(value)),
                    Err(err) if err.is_canceled() => None,
                    Err(err) => {
                        warn!(
                            target: "Shardis",
                            shard_id = %shard_id,
                            error = %err,
                            "shard failed, captured in best-effort mode"
                        );
                        captured
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push((shard_id.clone(), err));
                        None
                    }
                })
            })
            .boxed()
    }
}

fn wrap_shard_error(shard_id: &ShardId, err: ShardisError) -> ShardisError {
    match err {
        ShardisError::Query(_) => err,
        other => {
            let detail = other.to_string();
            QueryError::shard_execution_failed(
                shard_id.clone(),
                detail,
                Some(anyhow::Error::new(other)),
            )
            .into()
        }
    }
}

#[async_trait]
impl ShardQueryExecutor for FanOutQueryExecutor {
    async fn execute(
        &self,
        model: &QueryModel,
        cancel: &CancellationToken,
    ) -> ShardisResult<ShardQueryResults> {
        let started = Instant::now();
        let (targets, invalid_count) = self.normalize_targets(model);

        // An ordered merge needs sorted per-shard streams, which only
        // providers declaring the capability deliver. Otherwise fall back.
        let ordering = match &self.options.merge_strategy {
            MergeStrategy::Ordered { field, direction }
                if self.provider.supports_ordered_merge() =>
            {
                Some(OrderBy {
                    field: field.clone(),
                    direction: *direction,
                })
            }
            MergeStrategy::Ordered { .. } => {
                warn!(
                    target: "Shardis",
                    provider = self.provider.name(),
                    "provider does not support ordered merge, falling back to unordered"
                );
                None
            }
            MergeStrategy::Unordered => None,
        };
        let effective = match &ordering {
            Some(order_by) => model.clone().with_order_by(order_by.clone()),
            None => model.clone(),
        };

        let captured: CapturedFailures = Arc::new(Mutex::new(Vec::new()));
        let mut per_shard = Vec::with_capacity(targets.len());
        for shard in &targets {
            let mut stream = self.shard_stream(shard, &effective, cancel);
            if self.options.failure_mode == FailureMode::BestEffort {
                stream =
                    Self::capture_errors(stream, shard.id.clone(), Arc::clone(&captured));
            }
            per_shard.push(stream);
        }

        let merged = match &ordering {
            None => merge_unordered(
                per_shard,
                MergeOptions {
                    channel_capacity: self.options.channel_capacity,
                    max_concurrency: self.options.concurrency,
                },
                Arc::clone(&self.observer),
                cancel,
            ),
            Some(order_by) => {
                let field = order_by.field.clone();
                merge_ordered(
                    per_shard,
                    move |row: &Value| JsonOrderKey::extract(row, &field),
                    order_by.direction,
                    Arc::clone(&self.observer),
                    cancel,
                )
            }
        };

        let tags = QueryTags {
            db_system: self.provider.system(),
            provider: self.provider.name(),
            shard_count: self.shards.len(),
            target_shard_count: targets.len(),
            invalid_shard_count: invalid_count,
            merge_strategy: if ordering.is_some() {
                "ordered"
            } else {
                "unordered"
            },
            ordering_buffered: false,
            fanout_concurrency: self
                .options
                .concurrency
                .unwrap_or(targets.len())
                .min(targets.len().max(1)),
            channel_capacity: self
                .options
                .channel_capacity
                .map(|c| c as i64)
                .unwrap_or(-1),
            failure_mode: self.options.failure_mode.tag(),
            root_type: model.source_type.clone(),
        };

        let guarded = QueryMetricsGuard {
            inner: merged,
            collector: Arc::clone(&self.collector),
            tags: Some(tags),
            started,
            status: "ok",
            completed: false,
            cancel: cancel.clone(),
        };

        Ok(ShardQueryResults {
            stream: guarded.boxed(),
            captured,
        })
    }

    fn registered_shards(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::merge::SortDirection;
    use crate::infrastructure::query::model::FilterOperator;
    use crate::infrastructure::query::provider::InMemoryShardQueryProvider;
    use serde_json::json;

    fn shards(n: usize) -> Vec<Shard> {
        (0..n)
            .map(|i| Shard::new(format!("{}", i), format!("mem://{}", i)))
            .collect()
    }

    async fn seeded_provider(n: usize) -> Arc<InMemoryShardQueryProvider> {
        let provider = Arc::new(InMemoryShardQueryProvider::new());
        for i in 0..n {
            provider
                .insert_rows(
                    &ShardId::new(format!("{}", i)),
                    "users",
                    vec![
                        json!({"id": i * 10, "shard": i}),
                        json!({"id": i * 10 + 1, "shard": i}),
                    ],
                )
                .await;
        }
        provider
    }

    #[tokio::test]
    async fn test_fan_out_collects_all_shards() {
        let provider = seeded_provider(3).await;
        let executor =
            FanOutQueryExecutor::new(shards(3), provider, QueryOptions::default()).unwrap();

        let results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let rows: Vec<Value> = results.map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 6);
    }

    #[tokio::test]
    async fn test_targeted_execution_counts_invalid() {
        let provider = seeded_provider(3).await;
        let executor =
            FanOutQueryExecutor::new(shards(3), provider, QueryOptions::default()).unwrap();

        let model = QueryModel::new("users").where_shards(vec![
            ShardId::new("0"),
            ShardId::new("nope"),
            ShardId::new("2"),
        ]);
        let results = executor
            .execute(&model, &CancellationToken::new())
            .await
            .unwrap();
        let rows: Vec<Value> = results.map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn test_ordered_merge_produces_global_order() {
        let provider = seeded_provider(3).await;
        let options = QueryOptions {
            merge_strategy: MergeStrategy::Ordered {
                field: "id".to_string(),
                direction: SortDirection::Ascending,
            },
            ..Default::default()
        };
        let executor = FanOutQueryExecutor::new(shards(3), provider, options).unwrap();

        let results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let ids: Vec<i64> = results
            .map(|r| r.unwrap()["id"].as_i64().unwrap())
            .collect()
            .await;
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn test_fail_fast_surfaces_error() {
        let provider = seeded_provider(3).await;
        provider.fail_execution_for(&ShardId::new("1")).await;
        let executor =
            FanOutQueryExecutor::new(shards(3), provider, QueryOptions::default()).unwrap();

        let results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let collected: Vec<ShardisResult<Value>> = results.collect().await;
        assert!(collected.iter().any(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_best_effort_captures_and_completes() {
        let provider = seeded_provider(3).await;
        provider.fail_execution_for(&ShardId::new("1")).await;
        let options = QueryOptions {
            failure_mode: FailureMode::BestEffort,
            ..Default::default()
        };
        let executor = FanOutQueryExecutor::new(shards(3), provider, options).unwrap();

        let mut results = executor
            .execute(&QueryModel::new("users"), &CancellationToken::new())
            .await
            .unwrap();
        let mut rows = Vec::new();
        while let Some(item) = results.next().await {
            rows.push(item.unwrap());
        }
        assert_eq!(rows.len(), 4);
        let failures = results.captured_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, ShardId::new("1"));
    }

    #[tokio::test]
    async fn test_filters_applied_per_shard() {
        let provider = seeded_provider(3).await;
        let executor =
            FanOutQueryExecutor::new(shards(3), provider, QueryOptions::default()).unwrap();

        let model = QueryModel::new("users").filter("shard", FilterOperator::Eq, json!(1));
        let results = executor
            .execute(&model, &CancellationToken::new())
            .await
            .unwrap();
        let rows: Vec<Value> = results.map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["shard"] == json!(1)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_stream() {
        let provider = Arc::new(
            InMemoryShardQueryProvider::new()
                .with_row_delay(std::time::Duration::from_millis(5)),
        );
        for i in 0..2 {
            let rows: Vec<Value> = (0..1000).map(|n| json!({"id": n})).collect();
            provider
                .insert_rows(&ShardId::new(format!("{}", i)), "users", rows)
                .await;
        }
        let executor =
            FanOutQueryExecutor::new(shards(2), provider, QueryOptions::default()).unwrap();

        let cancel = CancellationToken::new();
        let mut results = executor
            .execute(&QueryModel::new("users"), &cancel)
            .await
            .unwrap();

        let mut seen = 0;
        while let Some(item) = results.next().await {
            if item.is_err() {
                break;
            }
            seen += 1;
            if seen == 5 {
                cancel.cancel();
            }
        }
        assert!(seen < 2000);
    }
}
