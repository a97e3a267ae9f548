// Migration Executor - Copy, verify, swap with durable checkpoints
// Bounded concurrency via semaphores and the budget governor, retry with
// jittered exponential backoff, resumption from the last checkpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::strong_types::{ShardKey, ShardKeyValue};
use crate::error::{
    MigrationError, MigrationErrorKind, MigrationPhase, ShardisError, ShardisResult,
};
use crate::infrastructure::migration::budget::{BudgetGovernor, BudgetGovernorConfig};
use crate::infrastructure::migration::checkpoint::{CheckpointStore, MigrationCheckpoint};
use crate::infrastructure::migration::mover::{DataMover, MapSwapper};
use crate::infrastructure::migration::plan::{KeyMove, KeyMoveState, MigrationPlan};
use crate::infrastructure::migration::verification::VerificationStrategy;

/// Options for one migration run
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub copy_concurrency: usize,
    pub verify_concurrency: usize,
    /// Verified keys are swapped in serial batches of this size
    pub swap_batch_size: usize,
    /// Retries per key operation beyond the first attempt
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Verify keys as soon as they are copied instead of phase-by-phase
    pub interleave_copy_and_verify: bool,
    /// Swap keys whose verification mismatched, flagging them in progress
    pub force_swap_on_verification_failure: bool,
    /// Copy/verify terminal transitions between checkpoints
    pub checkpoint_batch_size: usize,
    /// Minimum interval between throttled progress reports
    pub progress_interval: Duration,
    pub budget: BudgetGovernorConfig,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            copy_concurrency: 8,
            verify_concurrency: 8,
            swap_batch_size: 100,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            interleave_copy_and_verify: true,
            force_swap_on_verification_failure: false,
            checkpoint_batch_size: 64,
            progress_interval: Duration::from_millis(500),
            budget: BudgetGovernorConfig::default(),
        }
    }
}

/// Point-in-time progress of a running migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationProgressEvent {
    pub copied: u64,
    pub verified: u64,
    pub swapped: u64,
    pub failed: u64,
    pub active_copy: u64,
    pub active_verify: u64,
    pub total: u64,
}

/// Receives throttled progress events plus one final event per run
pub trait MigrationProgressSink: Send + Sync {
    fn report(&self, event: &MigrationProgressEvent);
}

/// Sink that discards all events
pub struct NoopProgressSink;

impl MigrationProgressSink for NoopProgressSink {
    fn report(&self, _event: &MigrationProgressEvent) {}
}

/// Final accounting for a run. Totals are cumulative over the plan's
/// lifetime, so re-running a completed plan reports the same counts.
#[derive(Debug, Clone)]
pub struct MigrationSummary {
    pub plan_id: Uuid,
    pub total: u64,
    pub copied: u64,
    pub verified: u64,
    pub swapped: u64,
    pub failed: u64,
    /// Retry attempts performed during this run
    pub retries: u64,
    /// Keys swapped despite a verification mismatch
    pub forced_swaps: u64,
    /// Swap batches issued during this run
    pub swap_batches: u64,
    pub canceled: bool,
    pub duration: Duration,
}

struct RunContext<K: ShardKeyValue> {
    plan: MigrationPlan<K>,
    options: MigrationOptions,
    mover: Arc<dyn DataMover<K>>,
    verification: Arc<dyn VerificationStrategy<K>>,
    swapper: Arc<dyn MapSwapper<K>>,
    checkpoints: Arc<dyn CheckpointStore<K>>,
    progress: Arc<dyn MigrationProgressSink>,
    governor: Arc<BudgetGovernor>,

    states: StdMutex<HashMap<ShardKey<K>, KeyMoveState>>,
    copied: AtomicU64,
    verified: AtomicU64,
    swapped: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    forced_swaps: AtomicU64,
    swap_batches: AtomicU64,
    active_copy: AtomicU64,
    active_verify: AtomicU64,

    checkpoint_version: Mutex<u64>,
    since_checkpoint: AtomicUsize,
    terminal_prefix: AtomicUsize,
    changed: AtomicBool,

    pending_swap: StdMutex<Vec<usize>>,
    swap_lock: Mutex<()>,

    run_cancel: CancellationToken,
    fatal: StdMutex<Option<ShardisError>>,
    progress_last: StdMutex<Instant>,
}

impl<K: ShardKeyValue> RunContext<K> {
    fn state_of(&self, key: &ShardKey<K>) -> KeyMoveState {
        *self
            .lock_states()
            .get(key)
            .unwrap_or(&KeyMoveState::Planned)
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<ShardKey<K>, KeyMoveState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, key: &ShardKey<K>, next: KeyMoveState) {
        let prev = {
            let mut states = self.lock_states();
            let Some(slot) = states.get_mut(key) else {
                return;
            };
            let prev = *slot;
            *slot = next;
            prev
        };
        if prev == next {
            return;
        }
        match next {
            KeyMoveState::Copied => {
                if !prev.copy_done() {
                    self.copied.fetch_add(1, Ordering::Relaxed);
                }
            }
            KeyMoveState::Verified => {
                if !prev.copy_done() {
                    self.copied.fetch_add(1, Ordering::Relaxed);
                }
                if !prev.verify_done() {
                    self.verified.fetch_add(1, Ordering::Relaxed);
                }
            }
            KeyMoveState::Swapped => {
                if !prev.copy_done() {
                    self.copied.fetch_add(1, Ordering::Relaxed);
                }
                if !prev.verify_done() {
                    self.verified.fetch_add(1, Ordering::Relaxed);
                }
                self.swapped.fetch_add(1, Ordering::Relaxed);
            }
            KeyMoveState::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            KeyMoveState::Planned => {}
        }
        self.changed.store(true, Ordering::Relaxed);
        self.since_checkpoint.fetch_add(1, Ordering::Relaxed);
    }

    fn progress_event(&self) -> MigrationProgressEvent {
        MigrationProgressEvent {
            copied: self.copied.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            swapped: self.swapped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active_copy: self.active_copy.load(Ordering::Relaxed),
            active_verify: self.active_verify.load(Ordering::Relaxed),
            total: self.plan.len() as u64,
        }
    }

    fn report_progress(&self, force: bool) {
        if !force {
            let mut last = self
                .progress_last
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.elapsed() < self.options.progress_interval {
                return;
            }
            *last = Instant::now();
        }
        self.progress.report(&self.progress_event());
    }

    fn set_fatal(&self, err: ShardisError) {
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.run_cancel.cancel();
    }

    fn take_fatal(&self) -> Option<ShardisError> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Index past the longest terminal-state prefix of the plan
    fn last_processed_index(&self) -> usize {
        let states = self.lock_states();
        let mut idx = self.terminal_prefix.load(Ordering::Relaxed);
        let moves = self.plan.moves();
        while idx < moves.len() {
            let terminal = states
                .get(&moves[idx].key)
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            if !terminal {
                break;
            }
            idx += 1;
        }
        self.terminal_prefix.store(idx, Ordering::Relaxed);
        idx
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = base.saturating_mul(2_u32.saturating_pow(attempt));
    let jitter = 1.0 + rand::rng().random_range(0.0..0.25);
    exp.mul_f64(jitter)
}

enum KeyOutcome {
    Done,
    Mismatch,
    Failed(ShardisError, u32),
    Canceled,
}

/// Runs migration plans through the copy -> verify -> swap pipeline
pub struct MigrationExecutor<K: ShardKeyValue> {
    mover: Arc<dyn DataMover<K>>,
    verification: Arc<dyn VerificationStrategy<K>>,
    swapper: Arc<dyn MapSwapper<K>>,
    checkpoints: Arc<dyn CheckpointStore<K>>,
    progress: Arc<dyn MigrationProgressSink>,
    options: MigrationOptions,
}

impl<K: ShardKeyValue> MigrationExecutor<K> {
    pub fn new(
        mover: Arc<dyn DataMover<K>>,
        verification: Arc<dyn VerificationStrategy<K>>,
        swapper: Arc<dyn MapSwapper<K>>,
        checkpoints: Arc<dyn CheckpointStore<K>>,
        options: MigrationOptions,
    ) -> Self {
        Self {
            mover,
            verification,
            swapper,
            checkpoints,
            progress: Arc::new(NoopProgressSink),
            options,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn MigrationProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Execute (or resume) `plan`. Cancellation stops new work, lets in-flight
    /// keys observe it at their next suspension point, and persists a final
    /// checkpoint before returning a summary with `canceled = true`.
    pub async fn execute(
        &self,
        plan: &MigrationPlan<K>,
        cancel: &CancellationToken,
    ) -> ShardisResult<MigrationSummary> {
        let started = Instant::now();

        let restored = self.checkpoints.load(plan.id()).await.map_err(|err| {
            let detail = err.to_string();
            MigrationError::new(
                MigrationErrorKind::CheckpointPersistFailed,
                MigrationPhase::Checkpoint,
                plan.id(),
                format!("checkpoint load failed: {}", detail),
            )
            .with_source(anyhow::Error::new(err))
        })?;

        let mut states: HashMap<ShardKey<K>, KeyMoveState> = plan
            .moves()
            .iter()
            .map(|mv| (mv.key.clone(), KeyMoveState::Planned))
            .collect();
        let mut restored_version = 0;
        if let Some(ckpt) = restored {
            restored_version = ckpt.version;
            for (key, state) in ckpt.states {
                if let Some(slot) = states.get_mut(&key) {
                    *slot = state;
                }
            }
            info!(
                target: "Shardis",
                plan_id = %plan.id(),
                checkpoint_version = restored_version,
                "resuming migration from checkpoint"
            );
        }

        let ctx = Arc::new(RunContext {
            plan: plan.clone(),
            options: self.options.clone(),
            mover: Arc::clone(&self.mover),
            verification: Arc::clone(&self.verification),
            swapper: Arc::clone(&self.swapper),
            checkpoints: Arc::clone(&self.checkpoints),
            progress: Arc::clone(&self.progress),
            governor: BudgetGovernor::new(self.options.budget.clone()),
            states: StdMutex::new(states),
            copied: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            swapped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            forced_swaps: AtomicU64::new(0),
            swap_batches: AtomicU64::new(0),
            active_copy: AtomicU64::new(0),
            active_verify: AtomicU64::new(0),
            checkpoint_version: Mutex::new(restored_version),
            since_checkpoint: AtomicUsize::new(0),
            terminal_prefix: AtomicUsize::new(0),
            changed: AtomicBool::new(false),
            pending_swap: StdMutex::new(Vec::new()),
            swap_lock: Mutex::new(()),
            run_cancel: cancel.child_token(),
            fatal: StdMutex::new(None),
            progress_last: StdMutex::new(Instant::now()),
        });

        // Seed cumulative counters from the restored states
        {
            let states = ctx.lock_states();
            for state in states.values() {
                if state.copy_done() {
                    ctx.copied.fetch_add(1, Ordering::Relaxed);
                }
                if state.verify_done() {
                    ctx.verified.fetch_add(1, Ordering::Relaxed);
                }
                match state {
                    KeyMoveState::Swapped => {
                        ctx.swapped.fetch_add(1, Ordering::Relaxed);
                    }
                    KeyMoveState::Failed => {
                        ctx.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }

        info!(
            target: "Shardis",
            plan_id = %plan.id(),
            moves = plan.len(),
            "migration started"
        );

        self.run_pipeline(&ctx).await;

        let canceled = cancel.is_cancelled();

        // One final checkpoint reflecting everything known so far
        if ctx.changed.load(Ordering::Relaxed) {
            persist_checkpoint(&ctx).await;
        }
        ctx.report_progress(true);

        if let Some(err) = ctx.take_fatal() {
            return Err(err);
        }

        let summary = MigrationSummary {
            plan_id: plan.id(),
            total: plan.len() as u64,
            copied: ctx.copied.load(Ordering::Relaxed),
            verified: ctx.verified.load(Ordering::Relaxed),
            swapped: ctx.swapped.load(Ordering::Relaxed),
            failed: ctx.failed.load(Ordering::Relaxed),
            retries: ctx.retries.load(Ordering::Relaxed),
            forced_swaps: ctx.forced_swaps.load(Ordering::Relaxed),
            swap_batches: ctx.swap_batches.load(Ordering::Relaxed),
            canceled,
            duration: started.elapsed(),
        };
        info!(
            target: "Shardis",
            plan_id = %plan.id(),
            swapped = summary.swapped,
            failed = summary.failed,
            canceled = summary.canceled,
            "migration finished"
        );
        Ok(summary)
    }

    async fn run_pipeline(&self, ctx: &Arc<RunContext<K>>) {
        let moves = ctx.plan.moves();
        if moves.is_empty() {
            return;
        }

        let interleave = ctx.options.interleave_copy_and_verify;
        let (verify_tx, verify_rx) = if interleave {
            let (tx, rx) = mpsc::unbounded_channel::<usize>();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // Keys restored mid-pipeline re-enter at their recorded state
        for (idx, mv) in moves.iter().enumerate() {
            match ctx.state_of(&mv.key) {
                KeyMoveState::Copied => {
                    if let Some(tx) = &verify_tx {
                        let _ = tx.send(idx);
                    }
                }
                KeyMoveState::Verified => enqueue_swap(ctx, idx).await,
                _ => {}
            }
        }

        // Interleaved verify workers start before copy so they drain as soon
        // as keys reach Copied
        let mut verify_workers = JoinSet::new();
        if let Some(rx) = verify_rx {
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..ctx.options.verify_concurrency.max(1) {
                let ctx = Arc::clone(ctx);
                let rx = Arc::clone(&rx);
                verify_workers.spawn(async move {
                    loop {
                        let next = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        match next {
                            Some(idx) => verify_key(&ctx, idx).await,
                            None => break,
                        }
                    }
                });
            }
        }

        // Copy phase
        let copy_sem = Arc::new(Semaphore::new(ctx.options.copy_concurrency.max(1)));
        let mut copy_set = JoinSet::new();
        for (idx, mv) in moves.iter().enumerate() {
            if ctx.run_cancel.is_cancelled() {
                break;
            }
            if ctx.state_of(&mv.key) != KeyMoveState::Planned {
                continue;
            }
            let Ok(permit) = Arc::clone(&copy_sem).acquire_owned().await else {
                break;
            };
            let ctx = Arc::clone(ctx);
            let tx = verify_tx.clone();
            copy_set.spawn(async move {
                let _permit = permit;
                copy_key(&ctx, idx, tx.as_ref()).await;
            });
            while copy_set.try_join_next().is_some() {}
        }
        while copy_set.join_next().await.is_some() {}
        drop(verify_tx);

        if interleave {
            while verify_workers.join_next().await.is_some() {}
        } else {
            // Phased verify over everything copy left behind
            let copied_indices: Vec<usize> = moves
                .iter()
                .enumerate()
                .filter(|(_, mv)| ctx.state_of(&mv.key) == KeyMoveState::Copied)
                .map(|(idx, _)| idx)
                .collect();
            let verify_sem = Arc::new(Semaphore::new(ctx.options.verify_concurrency.max(1)));
            let mut verify_set = JoinSet::new();
            for idx in copied_indices {
                if ctx.run_cancel.is_cancelled() {
                    break;
                }
                let Ok(permit) = Arc::clone(&verify_sem).acquire_owned().await else {
                    break;
                };
                let ctx = Arc::clone(ctx);
                verify_set.spawn(async move {
                    let _permit = permit;
                    verify_key(&ctx, idx).await;
                });
                while verify_set.try_join_next().is_some() {}
            }
            while verify_set.join_next().await.is_some() {}
        }

        // Swap whatever verified keys remain below a full batch
        if !ctx.run_cancel.is_cancelled() {
            let remainder: Vec<usize> = {
                let mut pending = ctx
                    .pending_swap
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                pending.drain(..).collect()
            };
            swap_batch(ctx, remainder).await;
        }
    }
}

async fn copy_key<K: ShardKeyValue>(
    ctx: &Arc<RunContext<K>>,
    idx: usize,
    verify_tx: Option<&mpsc::UnboundedSender<usize>>,
) {
    let mv = &ctx.plan.moves()[idx];
    let Some(_budget) = ctx.governor.acquire(&mv.source, &ctx.run_cancel).await else {
        return;
    };
    ctx.active_copy.fetch_add(1, Ordering::Relaxed);
    let outcome = attempt_with_retries(ctx, mv, MigrationPhase::Copy).await;
    ctx.active_copy.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        KeyOutcome::Done => {
            ctx.set_state(&mv.key, KeyMoveState::Copied);
            ctx.report_progress(false);
            if let Some(tx) = verify_tx {
                let _ = tx.send(idx);
            }
            checkpoint_tick(ctx).await;
        }
        KeyOutcome::Failed(err, attempts) => {
            warn!(
                target: "Shardis",
                plan_id = %ctx.plan.id(),
                key = %mv.key,
                attempts = attempts,
                error = %err,
                "copy failed permanently"
            );
            ctx.set_state(&mv.key, KeyMoveState::Failed);
            ctx.report_progress(false);
            checkpoint_tick(ctx).await;
        }
        KeyOutcome::Canceled | KeyOutcome::Mismatch => {}
    }
}

async fn verify_key<K: ShardKeyValue>(ctx: &Arc<RunContext<K>>, idx: usize) {
    let mv = &ctx.plan.moves()[idx];
    let Some(_budget) = ctx.governor.acquire(&mv.source, &ctx.run_cancel).await else {
        return;
    };
    ctx.active_verify.fetch_add(1, Ordering::Relaxed);
    let outcome = attempt_with_retries(ctx, mv, MigrationPhase::Verify).await;
    ctx.active_verify.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        KeyOutcome::Done => {
            ctx.governor.record_verification(true);
            ctx.set_state(&mv.key, KeyMoveState::Verified);
            ctx.report_progress(false);
            checkpoint_tick(ctx).await;
            enqueue_swap(ctx, idx).await;
        }
        KeyOutcome::Mismatch => {
            ctx.governor.record_verification(false);
            if ctx.options.force_swap_on_verification_failure {
                ctx.forced_swaps.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "Shardis",
                    plan_id = %ctx.plan.id(),
                    key = %mv.key,
                    "verification mismatch, swapping anyway (forced)"
                );
                ctx.set_state(&mv.key, KeyMoveState::Verified);
                ctx.report_progress(false);
                checkpoint_tick(ctx).await;
                enqueue_swap(ctx, idx).await;
            } else {
                warn!(
                    target: "Shardis",
                    plan_id = %ctx.plan.id(),
                    key = %mv.key,
                    "verification mismatch, key failed"
                );
                ctx.set_state(&mv.key, KeyMoveState::Failed);
                ctx.report_progress(false);
                checkpoint_tick(ctx).await;
            }
        }
        KeyOutcome::Failed(err, attempts) => {
            warn!(
                target: "Shardis",
                plan_id = %ctx.plan.id(),
                key = %mv.key,
                attempts = attempts,
                error = %err,
                "verify failed permanently"
            );
            ctx.set_state(&mv.key, KeyMoveState::Failed);
            ctx.report_progress(false);
            checkpoint_tick(ctx).await;
        }
        KeyOutcome::Canceled => {}
    }
}

/// Retry loop shared by copy and verify. `Ok(false)` from verification is a
/// mismatch and never retried; transient errors back off exponentially.
async fn attempt_with_retries<K: ShardKeyValue>(
    ctx: &Arc<RunContext<K>>,
    mv: &KeyMove<K>,
    phase: MigrationPhase,
) -> KeyOutcome {
    let mut attempt: u32 = 0;
    loop {
        if ctx.run_cancel.is_cancelled() {
            return KeyOutcome::Canceled;
        }
        let started = Instant::now();
        let result = match phase {
            MigrationPhase::Copy => ctx.mover.copy(mv).await.map(|_| true),
            MigrationPhase::Verify => ctx.verification.verify(mv).await,
            _ => unreachable!("retry loop only runs copy and verify"),
        };
        ctx.governor
            .record_latency(&mv.source, started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(true) => return KeyOutcome::Done,
            Ok(false) => return KeyOutcome::Mismatch,
            Err(err) => {
                if attempt >= ctx.options.max_retries {
                    let kind = match phase {
                        MigrationPhase::Copy => MigrationErrorKind::CopyFailed,
                        _ => MigrationErrorKind::VerifyFailed,
                    };
                    let wrapped = MigrationError::new(kind, phase, ctx.plan.id(), err.to_string())
                        .with_attempts(attempt + 1)
                        .with_shards(mv.source.clone(), mv.target.clone())
                        .with_source(anyhow::Error::new(err));
                    return KeyOutcome::Failed(wrapped.into(), attempt + 1);
                }
                let delay = backoff_delay(ctx.options.retry_base_delay, attempt);
                attempt += 1;
                ctx.retries.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "Shardis",
                    key = %mv.key,
                    phase = %phase,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off"
                );
                tokio::select! {
                    _ = ctx.run_cancel.cancelled() => return KeyOutcome::Canceled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Queue a verified key for swapping, flushing a full batch when one forms
async fn enqueue_swap<K: ShardKeyValue>(ctx: &Arc<RunContext<K>>, idx: usize) {
    let batch = {
        let mut pending = ctx
            .pending_swap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.push(idx);
        if pending.len() >= ctx.options.swap_batch_size.max(1) {
            pending.drain(..).collect::<Vec<_>>()
        } else {
            Vec::new()
        }
    };
    swap_batch(ctx, batch).await;
}

/// Apply one swap batch. Batches run serially; a failed batch is re-issued
/// whole, relying on shard-map assign idempotency.
async fn swap_batch<K: ShardKeyValue>(ctx: &Arc<RunContext<K>>, indices: Vec<usize>) {
    if indices.is_empty() {
        return;
    }
    let _serial = ctx.swap_lock.lock().await;
    if ctx.run_cancel.is_cancelled() {
        // Keys stay Verified; the final checkpoint lets a resume swap them
        return;
    }

    let moves: Vec<KeyMove<K>> = indices
        .iter()
        .map(|&i| ctx.plan.moves()[i].clone())
        .collect();
    let mut attempt: u32 = 0;
    loop {
        match ctx.swapper.swap(&moves).await {
            Ok(()) => {
                for mv in &moves {
                    ctx.set_state(&mv.key, KeyMoveState::Swapped);
                }
                ctx.swap_batches.fetch_add(1, Ordering::Relaxed);
                ctx.report_progress(false);
                persist_checkpoint(ctx).await;
                return;
            }
            Err(err) => {
                if attempt >= ctx.options.max_retries {
                    let wrapped = MigrationError::new(
                        MigrationErrorKind::SwapFailed,
                        MigrationPhase::Swap,
                        ctx.plan.id(),
                        format!("swap batch of {} keys failed: {}", moves.len(), err),
                    )
                    .with_attempts(attempt + 1)
                    .with_source(anyhow::Error::new(err));
                    ctx.set_fatal(wrapped.into());
                    return;
                }
                attempt += 1;
                ctx.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "Shardis",
                    plan_id = %ctx.plan.id(),
                    batch_size = moves.len(),
                    attempt = attempt,
                    error = %err,
                    "swap batch failed, re-issuing"
                );
                let delay = backoff_delay(ctx.options.retry_base_delay, attempt - 1);
                tokio::select! {
                    _ = ctx.run_cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn checkpoint_tick<K: ShardKeyValue>(ctx: &Arc<RunContext<K>>) {
    let since = ctx.since_checkpoint.load(Ordering::Relaxed);
    if since < ctx.options.checkpoint_batch_size.max(1) {
        return;
    }
    if ctx
        .since_checkpoint
        .compare_exchange(since, 0, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        persist_checkpoint(ctx).await;
    }
}

/// Persist a checkpoint at version previous+1. Store failure is
/// infrastructure-level and aborts the run.
async fn persist_checkpoint<K: ShardKeyValue>(ctx: &Arc<RunContext<K>>) {
    let mut version = ctx.checkpoint_version.lock().await;
    let states = ctx.lock_states().clone();
    let checkpoint = MigrationCheckpoint {
        plan_id: ctx.plan.id(),
        version: *version + 1,
        updated_at_utc: Utc::now(),
        states,
        last_processed_index: ctx.last_processed_index(),
    };
    match ctx.checkpoints.persist(&checkpoint).await {
        Ok(()) => {
            *version += 1;
            ctx.since_checkpoint.store(0, Ordering::Relaxed);
        }
        Err(err) => {
            let wrapped = match err {
                ShardisError::Migration(e)
                    if e.kind == MigrationErrorKind::CheckpointPersistFailed =>
                {
                    ShardisError::Migration(e)
                }
                other => MigrationError::new(
                    MigrationErrorKind::CheckpointPersistFailed,
                    MigrationPhase::Checkpoint,
                    ctx.plan.id(),
                    other.to_string(),
                )
                .with_source(anyhow::Error::new(other))
                .into(),
            };
            warn!(
                target: "Shardis",
                plan_id = %ctx.plan.id(),
                error = %wrapped,
                "checkpoint persist failed, aborting run"
            );
            ctx.set_fatal(wrapped);
        }
    }
}
