// Merge Engine - Combines per-shard result streams into one
// Unordered arrival-order interleave with bounded backpressure, and a
// streaming k-way merge for pre-sorted sources.

use std::collections::BinaryHeap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::error::ShardisResult;

/// Why a source stream stopped contributing to the merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStopReason {
    Completed,
    Canceled,
    Faulted,
}

/// Merge lifecycle callbacks. Implementations must not block; callbacks are
/// infallible and invoked inline from the merge machinery.
pub trait MergeObserver: Send + Sync {
    fn on_item(&self, _source: usize) {}
    fn on_source_completed(&self, _source: usize) {}
    fn on_source_stopped(&self, _source: usize, _reason: ShardStopReason) {}
    fn on_backpressure_wait_start(&self) {}
    fn on_backpressure_wait_stop(&self) {}
    fn on_heap_size(&self, _size: usize) {}
}

/// Observer that ignores every event
pub struct NoopMergeObserver;

impl MergeObserver for NoopMergeObserver {}

/// Options for the unordered merge
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Buffer capacity between producers and the consumer; `None` = unbounded
    pub channel_capacity: Option<usize>,
    /// Maximum number of sources polled concurrently; `None` = all at once
    pub max_concurrency: Option<usize>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            channel_capacity: Some(256),
            max_concurrency: None,
        }
    }
}

/// Sort direction for the ordered merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

enum MergeTx<T> {
    Bounded(mpsc::Sender<ShardisResult<T>>),
    Unbounded(mpsc::UnboundedSender<ShardisResult<T>>),
}

impl<T> Clone for MergeTx<T> {
    fn clone(&self) -> Self {
        match self {
            MergeTx::Bounded(tx) => MergeTx::Bounded(tx.clone()),
            MergeTx::Unbounded(tx) => MergeTx::Unbounded(tx.clone()),
        }
    }
}

impl<T> MergeTx<T> {
    fn at_capacity(&self) -> bool {
        match self {
            MergeTx::Bounded(tx) => tx.capacity() == 0,
            MergeTx::Unbounded(_) => false,
        }
    }

    async fn send(&self, item: ShardisResult<T>) -> Result<(), ()> {
        match self {
            MergeTx::Bounded(tx) => tx.send(item).await.map_err(|_| ()),
            MergeTx::Unbounded(tx) => tx.send(item).map_err(|_| ()),
        }
    }
}

/// Cancels the producer-side token when the consumer drops the stream
struct CancelOnDrop<T> {
    inner: BoxStream<'static, T>,
    token: CancellationToken,
}

impl<T> Stream for CancelOnDrop<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl<T> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Merge N lazy sources into a single stream in arrival order.
///
/// Producers block when the buffer is full (backpressure). Cancelling
/// `cancel` or dropping the returned stream stops every producer; the first
/// producer fault is forwarded and cancels the siblings.
pub fn merge_unordered<T: Send + 'static>(
    sources: Vec<BoxStream<'static, ShardisResult<T>>>,
    options: MergeOptions,
    observer: Arc<dyn MergeObserver>,
    cancel: &CancellationToken,
) -> BoxStream<'static, ShardisResult<T>> {
    let token = cancel.child_token();
    let (tx, rx): (MergeTx<T>, BoxStream<'static, ShardisResult<T>>) =
        match options.channel_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (MergeTx::Bounded(tx), ReceiverStream::new(rx).boxed())
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (MergeTx::Unbounded(tx), UnboundedReceiverStream::new(rx).boxed())
            }
        };

    let limiter = options
        .max_concurrency
        .map(|n| Arc::new(Semaphore::new(n.max(1))));

    for (idx, mut source) in sources.into_iter().enumerate() {
        let tx = tx.clone();
        let token = token.clone();
        let observer = Arc::clone(&observer);
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let _permit = match limiter {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        observer.on_source_stopped(idx, ShardStopReason::Canceled);
                        return;
                    }
                    next = source.next() => match next {
                        Some(Ok(item)) => {
                            let waited = tx.at_capacity();
                            if waited {
                                observer.on_backpressure_wait_start();
                            }
                            let sent = tx.send(Ok(item)).await;
                            if waited {
                                observer.on_backpressure_wait_stop();
                            }
                            if sent.is_err() {
                                observer.on_source_stopped(idx, ShardStopReason::Canceled);
                                return;
                            }
                            observer.on_item(idx);
                        }
                        Some(Err(err)) => {
                            let _ = tx.send(Err(err)).await;
                            token.cancel();
                            observer.on_source_stopped(idx, ShardStopReason::Faulted);
                            return;
                        }
                        None => {
                            observer.on_source_completed(idx);
                            observer.on_source_stopped(idx, ShardStopReason::Completed);
                            return;
                        }
                    }
                }
            }
        });
    }
    drop(tx);

    CancelOnDrop { inner: rx, token }.boxed()
}

struct HeadEntry<C: Ord, T> {
    key: C,
    source: usize,
    item: T,
    descending: bool,
}

impl<C: Ord, T> PartialEq for HeadEntry<C, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl<C: Ord, T> Eq for HeadEntry<C, T> {}

impl<C: Ord, T> PartialOrd for HeadEntry<C, T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: Ord, T> Ord for HeadEntry<C, T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the maximum; invert so the next-in-order entry is
        // on top, with ties broken stably by source index.
        let key_order = if self.descending {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };
        key_order.then_with(|| other.source.cmp(&self.source))
    }
}

struct OrderedMergeState<T, C: Ord, F> {
    sources: Vec<Option<BoxStream<'static, ShardisResult<T>>>>,
    heap: BinaryHeap<HeadEntry<C, T>>,
    key_fn: F,
    observer: Arc<dyn MergeObserver>,
    token: CancellationToken,
    descending: bool,
    primed: bool,
    failed: bool,
}

async fn pull_next<T, C, F>(
    sources: &mut [Option<BoxStream<'static, ShardisResult<T>>>],
    heap: &mut BinaryHeap<HeadEntry<C, T>>,
    key_fn: &F,
    observer: &Arc<dyn MergeObserver>,
    idx: usize,
    descending: bool,
) -> ShardisResult<()>
where
    C: Ord,
    F: Fn(&T) -> C,
{
    if let Some(source) = sources[idx].as_mut() {
        match source.next().await {
            Some(Ok(item)) => {
                let key = key_fn(&item);
                heap.push(HeadEntry {
                    key,
                    source: idx,
                    item,
                    descending,
                });
            }
            Some(Err(err)) => {
                sources[idx] = None;
                observer.on_source_stopped(idx, ShardStopReason::Faulted);
                return Err(err);
            }
            None => {
                sources[idx] = None;
                observer.on_source_completed(idx);
                observer.on_source_stopped(idx, ShardStopReason::Completed);
            }
        }
    }
    Ok(())
}

/// Streaming k-way merge over sources that are each already sorted by
/// `key_fn` in `direction`. The output is totally ordered; ties are broken by
/// source index, making the merge stable. Backpressure is implicit: a source
/// is only polled again after its previous item was yielded.
pub fn merge_ordered<T, C, F>(
    sources: Vec<BoxStream<'static, ShardisResult<T>>>,
    key_fn: F,
    direction: SortDirection,
    observer: Arc<dyn MergeObserver>,
    cancel: &CancellationToken,
) -> BoxStream<'static, ShardisResult<T>>
where
    T: Send + 'static,
    C: Ord + Send + 'static,
    F: Fn(&T) -> C + Send + Sync + 'static,
{
    let state = OrderedMergeState {
        sources: sources.into_iter().map(Some).collect(),
        heap: BinaryHeap::new(),
        key_fn,
        observer,
        token: cancel.clone(),
        descending: direction == SortDirection::Descending,
        primed: false,
        failed: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.failed || st.token.is_cancelled() {
            return None;
        }

        if !st.primed {
            st.primed = true;
            for idx in 0..st.sources.len() {
                if let Err(err) = pull_next(
                    &mut st.sources,
                    &mut st.heap,
                    &st.key_fn,
                    &st.observer,
                    idx,
                    st.descending,
                )
                .await
                {
                    st.failed = true;
                    return Some((Err(err), st));
                }
            }
        }

        let entry = st.heap.pop()?;
        st.observer.on_heap_size(st.heap.len());

        if let Err(err) = pull_next(
            &mut st.sources,
            &mut st.heap,
            &st.key_fn,
            &st.observer,
            entry.source,
            st.descending,
        )
        .await
        {
            st.failed = true;
            return Some((Err(err), st));
        }

        st.observer.on_item(entry.source);
        Some((Ok(entry.item), st))
    })
    .boxed()
}
