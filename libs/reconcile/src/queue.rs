//! Deduplicating, rate-limited work queue.
//!
//! Keys move through three sets:
//!
//! - `queue`: waiting to be handed to a worker, in FIFO order
//! - `dirty`: need processing (queued, or re-added while in flight)
//! - `processing`: currently held by a worker
//!
//! A key re-added while it is being processed stays in `dirty` only and is
//! put back on the queue when the worker calls [`WorkQueue::done`]. This is
//! what keeps two workers from ever holding the same key.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::backoff::{BackoffPolicy, ItemBackoff};

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    backoff: Mutex<ItemBackoff<K>>,

    /// Signalled when a key becomes available or the queue shuts down.
    available: Notify,

    /// Signalled when the last in-flight key is done after shutdown.
    drained: Notify,
}

/// Work queue handle. Cloning yields another handle to the same queue.
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

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Create a new queue with the given retry backoff.
    pub fn new(name: &'static str, backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                backoff: Mutex::new(ItemBackoff::new(backoff)),
                available: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Mark `key` as needing processing.
    ///
    /// Coalesced with any pending entry for the same key. Ignored once the
    /// queue is shutting down.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down {
            trace!(queue = self.inner.name, ?key, "Ignoring add after shutdown");
            return;
        }
        if state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Requeued by done().
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shutting down. The caller owns the
    /// returned key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer in flight.
    ///
    /// If the key was re-added while being processed it is queued again.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);

        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.available.notify_one();
        } else if state.shutting_down && state.processing.is_empty() {
            drop(state);
            self.inner.drained.notify_waiters();
        }
    }

    /// Reset retry backoff for `key`.
    pub fn forget(&self, key: &K) {
        self.backoff().forget(key);
    }

    /// Re-add `key` after its next backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.backoff().when(&key);
        debug!(
            queue = self.inner.name,
            ?key,
            delay_ms = delay.as_millis() as u64,
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Re-add `key` once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
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

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.backoff().num_requeues(key)
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }

    /// Stop handing out keys and reject new ones.
    ///
    /// Blocked [`WorkQueue::get`] calls return `None`. Keys already held by
    /// workers stay in flight until their `done`.
    pub fn shut_down(&self) {
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = self.inner.name, "Work queue shutting down");
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight key is done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.state().processing.is_empty() {
                return;
            }

            drained.await;
        }
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> MutexGuard<'_, ItemBackoff<K>> {
        self.inner
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
