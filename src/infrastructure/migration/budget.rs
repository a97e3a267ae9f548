// Budget Governor - Adaptive global in-flight budget for migration work
// Reduces the budget multiplicatively under per-shard latency or
// verification-mismatch stress, restores it slowly once signals stay healthy.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::strong_types::ShardId;

const LATENCY_WINDOW: usize = 128;

#[derive(Debug, Clone)]
pub struct BudgetGovernorConfig {
    /// Initial and maximum global in-flight budget
    pub initial_budget: usize,
    /// Budget floor under sustained stress
    pub min_budget: usize,
    /// Maximum in-flight operations against any single source shard
    pub per_shard_cap: usize,
    /// p95 latency above which the budget is reduced (milliseconds)
    pub p95_threshold_ms: f64,
    /// Verification mismatch rate above which the budget is reduced
    pub mismatch_rate_threshold: f64,
    /// Minimum time between recalculations
    pub recalc_interval: Duration,
    /// Healthy recalculations required before the budget grows again
    pub healthy_intervals_before_increase: u32,
}

impl Default for BudgetGovernorConfig {
    fn default() -> Self {
        Self {
            initial_budget: 256,
            min_budget: 32,
            per_shard_cap: 64,
            p95_threshold_ms: 500.0,
            mismatch_rate_threshold: 0.5,
            recalc_interval: Duration::from_secs(1),
            healthy_intervals_before_increase: 2,
        }
    }
}

#[derive(Debug)]
struct GovernorState {
    budget: usize,
    in_flight: usize,
    per_shard: HashMap<ShardId, usize>,
    latencies: HashMap<ShardId, VecDeque<f64>>,
    verifications: u64,
    mismatches: u64,
    last_recalc: Instant,
    healthy_streak: u32,
}

/// Global admission gate for copy/verify work. A permit must be held for the
/// duration of each per-key operation; dropping it frees the slot.
pub struct BudgetGovernor {
    config: BudgetGovernorConfig,
    state: Mutex<GovernorState>,
    notify: Notify,
}

impl BudgetGovernor {
    pub fn new(config: BudgetGovernorConfig) -> Arc<Self> {
        let state = GovernorState {
            budget: config.initial_budget.max(1),
            in_flight: 0,
            per_shard: HashMap::new(),
            latencies: HashMap::new(),
            verifications: 0,
            mismatches: 0,
            last_recalc: Instant::now(),
            healthy_streak: 0,
        };
        Arc::new(Self {
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        })
    }

    /// Current global budget
    pub fn current_budget(&self) -> usize {
        self.lock().budget
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a slot against `shard`. Returns `None` when `cancel` fires
    /// before a slot frees up.
    pub async fn acquire(
        self: &Arc<Self>,
        shard: &ShardId,
        cancel: &CancellationToken,
    ) -> Option<BudgetPermit> {
        loop {
            {
                let mut state = self.lock();
                self.maybe_recalc(&mut state);
                let shard_in_flight = state.per_shard.get(shard).copied().unwrap_or(0);
                if state.in_flight < state.budget && shard_in_flight < self.config.per_shard_cap {
                    state.in_flight += 1;
                    *state.per_shard.entry(shard.clone()).or_insert(0) += 1;
                    return Some(BudgetPermit {
                        governor: Arc::clone(self),
                        shard: shard.clone(),
                    });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    fn release(&self, shard: &ShardId) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(count) = state.per_shard.get_mut(shard) {
            *count = count.saturating_sub(1);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Record an operation latency sample against its source shard
    pub fn record_latency(&self, shard: &ShardId, latency_ms: f64) {
        let mut state = self.lock();
        let window = state.latencies.entry(shard.clone()).or_default();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency_ms);
    }

    /// Record a verification outcome
    pub fn record_verification(&self, matched: bool) {
        let mut state = self.lock();
        state.verifications += 1;
        if !matched {
            state.mismatches += 1;
        }
    }

    /// Single recalculation point: at most once per `recalc_interval`
    fn maybe_recalc(&self, state: &mut GovernorState) {
        if state.last_recalc.elapsed() < self.config.recalc_interval {
            return;
        }
        state.last_recalc = Instant::now();

        let worst_p95 = state
            .latencies
            .values()
            .map(|window| p95(window))
            .fold(0.0_f64, f64::max);
        let mismatch_rate = if state.verifications == 0 {
            0.0
        } else {
            state.mismatches as f64 / state.verifications as f64
        };
        state.verifications = 0;
        state.mismatches = 0;

        let stressed = worst_p95 > self.config.p95_threshold_ms
            || mismatch_rate > self.config.mismatch_rate_threshold;

        if stressed {
            state.healthy_streak = 0;
            let reduced = ((state.budget as f64) * 0.75) as usize;
            let next = reduced.max(self.config.min_budget);
            if next != state.budget {
                debug!(
                    target: "Shardis",
                    budget_previous = state.budget,
                    budget_next = next,
                    p95 = worst_p95,
                    mismatch_rate = mismatch_rate,
                    "budget reduced under stress"
                );
                state.budget = next;
            }
        } else {
            state.healthy_streak += 1;
            if state.healthy_streak >= self.config.healthy_intervals_before_increase
                && state.budget < self.config.initial_budget
            {
                let grown = state.budget + (state.budget / 10).max(1);
                state.budget = grown.min(self.config.initial_budget);
                self.notify.notify_waiters();
            }
        }
    }

    #[cfg(test)]
    fn force_recalc(&self) {
        let mut state = self.lock();
        state.last_recalc = Instant::now() - self.config.recalc_interval - Duration::from_millis(1);
        self.maybe_recalc(&mut state);
    }
}

fn p95(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Held for the duration of one governed operation
pub struct BudgetPermit {
    governor: Arc<BudgetGovernor>,
    shard: ShardId,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.governor.release(&self.shard);
    }
}
