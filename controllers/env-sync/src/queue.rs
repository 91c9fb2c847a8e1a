//! Deduplicating, rate-limited work queue.
//!
//! Keys move through three sets:
//!
//! - **queue**: waiting to be handed out by [`WorkQueue::get`]
//! - **dirty**: added since they were last handed out (superset of queue)
//! - **processing**: handed out and not yet [`done`](WorkQueue::done)
//!
//! A key is never in `queue` twice and never handed to two workers at once.
//! Adding a key that is being processed only marks it dirty; `done` puts it
//! back on the queue so the change is picked up by a fresh pass.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Default first retry delay for a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default cap on a failing key's retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-item exponential failure rate limiter
///
/// Each failure of a key doubles its next delay, starting at `base` and capped
/// at `max`. [`forget`](Self::forget) resets the key after a success.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialRateLimiter<K> {
    /// Limiter starting at `base` and capped at `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next retry of `key`; records one more failure.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = ExponentialBackoff::for_failure_count(*count, self.base, self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for ItemExponentialRateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    // Wakes workers blocked in `get`
    ready: Notify,
    // Wakes `shutdown_with_drain` when processing empties
    drained: Notify,
    limiter: ItemExponentialRateLimiter<K>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work queue of reconciliation keys, shared between the event funnel and workers.
///
/// Cloning is cheap and every clone refers to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue)
            .field("processing", &state.processing)
            .field("shutting_down", &state.shutting_down)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// Creates a queue with the default rate limiter (5ms doubling, capped at 1000s).
    pub fn new() -> Self {
        Self::with_rate_limiter(ItemExponentialRateLimiter::default())
    }

    /// Creates a queue that delays failing keys with `limiter`.
    pub fn with_rate_limiter(limiter: ItemExponentialRateLimiter<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                drained: Notify::new(),
                limiter,
            }),
        }
    }

    /// Marks `key` as needing processing. Duplicate adds collapse.
    pub fn add(&self, key: K) {
        {
            let mut state = lock(&self.inner.state);
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                debug!("{:?} is being processed, will requeue when done", key);
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.ready.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key must be passed to [`done`](Self::done) when processing ends.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // await is not missed.
            notified.as_mut().enable();
            {
                let mut state = lock(&self.inner.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Pass the wakeup on to the next idle worker
                        self.inner.ready.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as no longer being processed.
    pub fn done(&self, key: &K) {
        let mut requeued = false;
        let mut drained = false;
        {
            let mut state = lock(&self.inner.state);
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                requeued = true;
            }
            if state.processing.is_empty() {
                drained = true;
            }
        }
        if requeued {
            self.inner.ready.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Clears the failure history of `key` after a successful pass.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Re-adds `key` after its per-item backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        debug!("Requeueing {:?} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// How many times `key` has been rate-limited since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Whether no key is waiting to be handed out
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Stops the queue: further adds are ignored and every `get` returns `None`.
    ///
    /// Keys already handed out stay in processing until their worker calls `done`.
    pub fn shutdown(&self) {
        lock(&self.inner.state).shutting_down = true;
        self.inner.ready.notify_waiters();
    }

    /// Shuts down, then waits until every in-flight key has been marked done.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.inner.state).processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
