//! Delaying work queue and the worker pool that drains it.
//!
//! Keys are deduplicated while queued, and a key is never handed to two
//! workers at once: a key re-added while it is being processed is parked
//! and re-queued when the worker calls [`DelayingQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First delay applied after a handler error.
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the per-key retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Queue interface the tracker and reconciler schedule work through.
pub trait WorkQueue: Send + Sync {
    /// Queue `key` for processing. Adding an already queued key is a no-op.
    fn add(&self, key: &str);
    /// Queue `key` once `delay` has elapsed.
    fn add_after(&self, key: &str, delay: Duration);
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_owned());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_owned());
        drop(state);
        self.notify.notify_one();
    }
}

/// In-process delaying queue with per-key exclusivity.
///
/// Cloning is cheap; all clones share the same queue. Delayed adds spawn a
/// Tokio timer task, so [`WorkQueue::add_after`] must be called from within
/// a runtime.
#[derive(Debug, Clone, Default)]
pub struct DelayingQueue {
    inner: Arc<Inner>,
}

impl DelayingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is marked as processing until [`Self::done`] is called.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.inner.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`Self::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkQueue for DelayingQueue {
    fn add(&self, key: &str) {
        self.inner.add(key);
    }

    fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.inner.add(key);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.add(&key);
        });
    }
}

/// Work performed for a single dequeued key.
#[async_trait]
pub trait KeyHandler: Send + Sync {
    /// Error type surfaced to the worker pool.
    type Error: std::fmt::Display + Send + 'static;

    /// Process `key` to completion.
    async fn handle(&self, key: &str) -> Result<(), Self::Error>;
}

/// Per-key exponential retry delays for handler failures.
#[derive(Debug, Default)]
pub struct RetryBackoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryBackoff {
    /// Record a failure for `key` and return the delay before the next attempt.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = failures.entry(key.to_owned()).or_insert(0);
        let exponent = (*count).min(16);
        *count = count.saturating_add(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        BASE_RETRY_DELAY
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }

    /// Forget the failure history of `key`.
    pub fn forget(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

/// Spawn `workers` tasks draining `queue` through `handler`.
///
/// Each key is handled in its own task, so a panicking handler counts as a
/// failure instead of killing the worker. Failed keys are re-added with
/// [`RetryBackoff`]. Workers exit when the
/// shutdown channel flips to `true` (the queue is shut down on their behalf)
/// or the queue is shut down directly.
pub fn run_workers<H>(
    queue: DelayingQueue,
    workers: usize,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    H: KeyHandler + 'static,
{
    let backoff = Arc::new(RetryBackoff::default());
    let mut handles = Vec::with_capacity(workers.saturating_add(1));

    let watcher_queue = queue.clone();
    handles.push(tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        watcher_queue.shutdown();
    }));

    for worker in 0..workers {
        let queue = queue.clone();
        let handler = Arc::clone(&handler);
        let backoff = Arc::clone(&backoff);
        handles.push(tokio::spawn(async move {
            debug!(worker, "worker started");
            while let Some(key) = queue.get().await {
                let task_handler = Arc::clone(&handler);
                let task_key = key.clone();
                let outcome =
                    tokio::spawn(async move { task_handler.handle(&task_key).await }).await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(format!("handler aborted: {e}")),
                };
                match failure {
                    None => backoff.forget(&key),
                    Some(error) => {
                        let delay = backoff.next_delay(&key);
                        warn!(
                            worker,
                            key = %key,
                            %error,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "sync failed, retrying"
                        );
                        queue.add_after(&key, delay);
                    }
                }
                queue.done(&key);
            }
            info!(worker, "worker stopped");
        }));
    }

    handles
}
