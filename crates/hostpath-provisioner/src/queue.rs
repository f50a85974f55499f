//! A deduplicating work queue with in-flight tracking and per-key backoff.
//!
//! A key is in at most one of two places: waiting in the queue, or being
//! processed by a worker. Adding a key that is already waiting is a no-op.
//! Adding a key that is being processed marks it dirty, and it is queued
//! again once the worker calls [`WorkQueue::done`]. Two workers therefore
//! never hold the same key at once.
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, (ExponentialBackoffStrategy, usize)>,
    shutting_down: bool,
}

/// See the [module documentation](self).
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: ExponentialBackoffStrategy,
}

impl<K> Default for WorkQueue<K> {
    fn default() -> Self {
        WorkQueue::with_backoff(ExponentialBackoffStrategy::default())
    }
}

impl<K> WorkQueue<K> {
    /// Creates a queue whose rate-limited re-adds follow `backoff`.
    pub fn with_backoff(backoff: ExponentialBackoffStrategy) -> Self {
        WorkQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        // The lock is never held across an await or a call that can panic
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Creates an empty queue with the default backoff.
    pub fn new() -> Self {
        WorkQueue::default()
    }

    /// Queues `key` unless it is already waiting.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for the next key and marks it as being processed. Returns `None`
    /// once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    drop(inner);
                    // Pass the wake-up along to the next waiting worker
                    self.notify.notify_one();
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks `key` as no longer being processed, queueing it again if it was
    /// added in the meantime.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Drops a waiting key, for objects that were deleted. A worker already
    /// holding the key is unaffected.
    pub fn remove(&self, key: &K) {
        let mut inner = self.lock();
        if inner.dirty.remove(key) {
            inner.queue.retain(|k| k != key);
        }
        inner.failures.remove(key);
    }

    /// Re-adds `key` after its next backoff delay and returns the delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut inner = self.lock();
            let backoff = &self.backoff;
            let (backoff, count) = inner
                .failures
                .entry(key.clone())
                .or_insert_with(|| (backoff.clone(), 0));
            *count += 1;
            backoff.next_duration()
        };
        self.add_after(key, delay);
        delay
    }

    /// Clears the backoff history of `key` after it succeeded.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of rate-limited re-adds since `key` was last forgotten.
    pub fn requeues(&self, key: &K) -> usize {
        self.lock()
            .failures
            .get(key)
            .map(|(_, count)| *count)
            .unwrap_or_default()
    }

    /// Adds `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(key);
            }
        });
    }

    /// Drops everything waiting and wakes all workers; [`get`](Self::get)
    /// returns `None` from now on.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutting_down = true;
        inner.queue.clear();
        inner.dirty.clear();
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of keys waiting.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_waits_for_done() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty(), "in-flight key must not be handed out again");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn removed_keys_are_not_handed_out() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.remove(&"a");
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off() {
        let queue = Arc::new(WorkQueue::with_backoff(
            ExponentialBackoffStrategy::default().with_jitter(0.0),
        ));
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert_eq!(queue.add_rate_limited(key), Duration::from_millis(100));
        assert!(queue.is_empty());

        let start = tokio::time::Instant::now();
        let key = queue.get().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        queue.done(&key);
        assert_eq!(queue.add_rate_limited(key), Duration::from_millis(200));
        assert_eq!(queue.requeues(&"a"), 2);

        queue.forget(&"a");
        assert_eq!(queue.requeues(&"a"), 0);
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert_eq!(queue.add_rate_limited(key), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = Arc::new(WorkQueue::<&'static str>::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.shutdown();
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }
        queue.add("late");
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_key_is_processed_concurrently() {
        let queue = Arc::new(WorkQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = in_flight.clone();
                let processed = processed.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(now, 0, "two workers held {:?}", key);
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        processed.fetch_add(1, Ordering::SeqCst);
                        queue.done(&key);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            queue.add("same");
            tokio::task::yield_now().await;
        }
        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(processed.load(Ordering::SeqCst) >= 1);
    }
}
