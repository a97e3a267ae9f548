// Health Policy - Probe-driven shard availability tracking
// Hysteresis thresholds and cooldown damp flapping; the query and migration
// cores consume the classification surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::strong_types::{Shard, ShardId};
use crate::infrastructure::monitoring::{
    metrics, MetricsCollector, METRIC_HEALTH_PROBE_LATENCY, METRIC_HEALTH_SHARD_RECOVERED,
};

/// Estimated health of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardHealthStatus {
    Unknown,
    Healthy,
    /// Reserved intermediate state; the default policy never emits it
    Degraded,
    Unhealthy,
}

/// Point-in-time health report for a shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardHealthReport {
    pub shard_id: ShardId,
    pub status: ShardHealthStatus,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
    pub last_error: Option<String>,
    pub probe_duration_ms: Option<u64>,
}

/// Health policy configuration
#[derive(Debug, Clone)]
pub struct HealthPolicyConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub cooldown_period: Duration,
    pub reactive_tracking_enabled: bool,
}

impl Default for HealthPolicyConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            cooldown_period: Duration::from_secs(30),
            reactive_tracking_enabled: false,
        }
    }
}

/// How many healthy shards a query needs before it may run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShardAvailabilityRequirement {
    /// Any number of healthy shards, including zero
    BestEffort,
    /// Every targeted shard must be healthy
    AllShards,
    /// At least `n` healthy shards
    AtLeast(usize),
    /// At least `p` of the targeted shards healthy, `0 < p <= 1`
    AtLeastPercentage(f64),
}

impl ShardAvailabilityRequirement {
    pub fn at_least_percentage(p: f64) -> Self {
        assert!(
            p > 0.0 && p <= 1.0,
            "Availability percentage must be in (0, 1]"
        );
        Self::AtLeastPercentage(p)
    }

    /// Whether `healthy` of `total` targeted shards satisfies this requirement
    pub fn is_satisfied(&self, total: usize, healthy: usize) -> bool {
        match self {
            Self::BestEffort => true,
            Self::AllShards => healthy == total,
            Self::AtLeast(n) => healthy >= *n,
            Self::AtLeastPercentage(p) => (healthy as f64) >= (*p * total as f64),
        }
    }
}

impl std::fmt::Display for ShardAvailabilityRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best-effort"),
            Self::AllShards => write!(f, "all-shards"),
            Self::AtLeast(n) => write!(f, "at-least({})", n),
            Self::AtLeastPercentage(p) => write!(f, "at-least-percentage({})", p),
        }
    }
}

/// Probes a shard's backing store. Implementations come from storage drivers.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, shard: &Shard) -> anyhow::Result<()>;
}

/// Probe that always succeeds, for wiring and tests
pub struct AlwaysHealthyProbe;

#[async_trait]
impl HealthProbe for AlwaysHealthyProbe {
    async fn probe(&self, _shard: &Shard) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ShardHealthState {
    status: ShardHealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_probe_at: Option<DateTime<Utc>>,
    last_transition_at: Instant,
    description: Option<String>,
    last_error: Option<String>,
    last_probe_duration_ms: Option<u64>,
    probe_in_flight: bool,
}

impl ShardHealthState {
    fn new() -> Self {
        Self {
            status: ShardHealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe_at: None,
            last_transition_at: Instant::now(),
            description: None,
            last_error: None,
            last_probe_duration_ms: None,
            probe_in_flight: false,
        }
    }
}

struct HealthPolicyInner {
    shards: RwLock<HashMap<ShardId, Shard>>,
    states: RwLock<HashMap<ShardId, ShardHealthState>>,
    probe: Arc<dyn HealthProbe>,
    config: HealthPolicyConfig,
    cancel: CancellationToken,
    metrics: Arc<MetricsCollector>,
}

/// Tracks an estimated health status per shard. One internal scheduler fires
/// every `probe_interval`; probes run concurrently across shards but at most
/// one probe is outstanding per shard at any time.
pub struct HealthPolicy {
    inner: Arc<HealthPolicyInner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl HealthPolicy {
    pub fn new(shards: Vec<Shard>, probe: Arc<dyn HealthProbe>, config: HealthPolicyConfig) -> Self {
        let mut shard_map = HashMap::new();
        let mut states = HashMap::new();
        for shard in shards {
            states.insert(shard.id.clone(), ShardHealthState::new());
            shard_map.insert(shard.id.clone(), shard);
        }
        Self {
            inner: Arc::new(HealthPolicyInner {
                shards: RwLock::new(shard_map),
                states: RwLock::new(states),
                probe,
                config,
                cancel: CancellationToken::new(),
                metrics: metrics(),
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// Start the periodic probe scheduler
    pub async fn start(&self) {
        let mut guard = self.scheduler.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        Self::probe_all(&inner).await;
                    }
                }
            }
            debug!("health scheduler stopped");
        });
        *guard = Some(handle);
    }

    /// Stop the scheduler and release its task
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.scheduler.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn probe_all(inner: &Arc<HealthPolicyInner>) {
        let shards: Vec<Shard> = inner.shards.read().await.values().cloned().collect();
        for shard in shards {
            // At most one outstanding probe per shard
            {
                let mut states = inner.states.write().await;
                let state = states
                    .entry(shard.id.clone())
                    .or_insert_with(ShardHealthState::new);
                if state.probe_in_flight {
                    continue;
                }
                state.probe_in_flight = true;
            }

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::run_probe(&inner, &shard).await;
                let mut states = inner.states.write().await;
                if let Some(state) = states.get_mut(&shard.id) {
                    state.probe_in_flight = false;
                }
            });
        }
    }

    async fn run_probe(inner: &Arc<HealthPolicyInner>, shard: &Shard) {
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            result = tokio::time::timeout(inner.config.probe_timeout, inner.probe.probe(shard)) => result,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        inner
            .metrics
            .record_histogram(METRIC_HEALTH_PROBE_LATENCY, elapsed_ms as f64);

        match outcome {
            Ok(Ok(())) => Self::apply_success(inner, &shard.id, Some(elapsed_ms)).await,
            Ok(Err(err)) => {
                Self::apply_failure(inner, &shard.id, err.to_string(), Some(elapsed_ms)).await
            }
            Err(_) => {
                Self::apply_failure(
                    inner,
                    &shard.id,
                    format!("probe timed out after {:?}", inner.config.probe_timeout),
                    Some(elapsed_ms),
                )
                .await
            }
        }
    }

    async fn apply_success(
        inner: &Arc<HealthPolicyInner>,
        shard_id: &ShardId,
        duration_ms: Option<u64>,
    ) {
        let mut states = inner.states.write().await;
        let state = states
            .entry(shard_id.clone())
            .or_insert_with(ShardHealthState::new);
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        state.last_probe_at = Some(Utc::now());
        state.last_probe_duration_ms = duration_ms;
        state.last_error = None;

        let next = match state.status {
            ShardHealthStatus::Unknown => Some(ShardHealthStatus::Healthy),
            ShardHealthStatus::Unhealthy | ShardHealthStatus::Degraded => {
                let cooled =
                    state.last_transition_at.elapsed() >= inner.config.cooldown_period;
                if state.consecutive_successes >= inner.config.healthy_threshold && cooled {
                    Some(ShardHealthStatus::Healthy)
                } else {
                    None
                }
            }
            ShardHealthStatus::Healthy => None,
        };

        if let Some(next) = next {
            let old = state.status;
            state.status = next;
            state.last_transition_at = Instant::now();
            state.description = None;
            info!("Shard {} health changed: {:?} -> {:?}", shard_id, old, next);
            if old == ShardHealthStatus::Unhealthy || old == ShardHealthStatus::Degraded {
                inner
                    .metrics
                    .increment_counter(METRIC_HEALTH_SHARD_RECOVERED, 1);
            }
        }
    }

    async fn apply_failure(
        inner: &Arc<HealthPolicyInner>,
        shard_id: &ShardId,
        error: String,
        duration_ms: Option<u64>,
    ) {
        let mut states = inner.states.write().await;
        let state = states
            .entry(shard_id.clone())
            .or_insert_with(ShardHealthState::new);
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.last_probe_at = Some(Utc::now());
        state.last_probe_duration_ms = duration_ms;
        state.last_error = Some(error);

        let trips = state.consecutive_failures >= inner.config.unhealthy_threshold;
        if trips && state.status != ShardHealthStatus::Unhealthy {
            let old = state.status;
            state.status = ShardHealthStatus::Unhealthy;
            state.last_transition_at = Instant::now();
            state.description = Some(format!(
                "{} consecutive probe failures",
                state.consecutive_failures
            ));
            warn!(
                "Shard {} is now unhealthy ({:?} -> Unhealthy)",
                shard_id, old
            );
        }
    }

    /// Reactive success signal from callers; no-op unless enabled
    pub async fn record_success(&self, shard_id: &ShardId) {
        if !self.inner.config.reactive_tracking_enabled {
            return;
        }
        Self::apply_success(&self.inner, shard_id, None).await;
    }

    /// Reactive failure signal from callers; no-op unless enabled
    pub async fn record_failure(&self, shard_id: &ShardId, error: &str) {
        if !self.inner.config.reactive_tracking_enabled {
            return;
        }
        Self::apply_failure(&self.inner, shard_id, error.to_string(), None).await;
    }

    /// Register a shard for probing (dynamic topology)
    pub async fn add_shard(&self, shard: Shard) {
        self.inner
            .states
            .write()
            .await
            .entry(shard.id.clone())
            .or_insert_with(ShardHealthState::new);
        self.inner.shards.write().await.insert(shard.id.clone(), shard);
    }

    /// Deregister a shard; its state is discarded
    pub async fn remove_shard(&self, shard_id: &ShardId) {
        self.inner.shards.write().await.remove(shard_id);
        self.inner.states.write().await.remove(shard_id);
    }

    /// Whether the shard is currently routable. Unprobed shards count as
    /// routable so cold processes can serve before the first interval fires.
    pub async fn is_healthy(&self, shard_id: &ShardId) -> bool {
        let states = self.inner.states.read().await;
        states
            .get(shard_id)
            .map(|s| s.status != ShardHealthStatus::Unhealthy)
            .unwrap_or(true)
    }

    /// Split a target set into (healthy, unhealthy) by current status
    pub async fn classify_targets(&self, targets: &[ShardId]) -> (Vec<ShardId>, Vec<ShardId>) {
        let states = self.inner.states.read().await;
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for id in targets {
            let routable = states
                .get(id)
                .map(|s| s.status != ShardHealthStatus::Unhealthy)
                .unwrap_or(true);
            if routable {
                healthy.push(id.clone());
            } else {
                unhealthy.push(id.clone());
            }
        }
        (healthy, unhealthy)
    }

    /// Current report for one shard
    pub async fn report(&self, shard_id: &ShardId) -> Option<ShardHealthReport> {
        let states = self.inner.states.read().await;
        states.get(shard_id).map(|s| ShardHealthReport {
            shard_id: shard_id.clone(),
            status: s.status,
            timestamp: s.last_probe_at.unwrap_or_else(Utc::now),
            description: s.description.clone(),
            last_error: s.last_error.clone(),
            probe_duration_ms: s.last_probe_duration_ms,
        })
    }

    /// Reports for all known shards
    pub async fn snapshot(&self) -> Vec<ShardHealthReport> {
        let states = self.inner.states.read().await;
        let mut reports: Vec<ShardHealthReport> = states
            .iter()
            .map(|(id, s)| ShardHealthReport {
                shard_id: id.clone(),
                status: s.status,
                timestamp: s.last_probe_at.unwrap_or_else(Utc::now),
                description: s.description.clone(),
                last_error: s.last_error.clone(),
                probe_duration_ms: s.last_probe_duration_ms,
            })
            .collect();
        reports.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        reports
    }

    /// Force a status, for tests and operational overrides
    pub async fn set_status(&self, shard_id: &ShardId, status: ShardHealthStatus) {
        let mut states = self.inner.states.write().await;
        let state = states
            .entry(shard_id.clone())
            .or_insert_with(ShardHealthState::new);
        state.status = status;
        state.last_transition_at = Instant::now();
    }
}

impl Drop for HealthPolicy {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
