//! Rate limited, deduplicating work queue.
//!
//! Keys wait in FIFO order among ready items. A key is never handed to two
//! workers at once: while a key is in flight, re-adds only mark it dirty and
//! it is re-enqueued a single time when the worker calls [`WorkQueue::done`].
//! Failed keys re-enter through [`WorkQueue::add_rate_limited`] with per-key
//! exponential back-off, reset by [`WorkQueue::forget`].
use std::{
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::Mutex,
    time::Duration,
};

use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};

/// Back-off floor for the first failure of a key.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Back-off ceiling.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// A deduplicating work queue with per-key back-off.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

struct Inner<K> {
    ready: VecDeque<K>,
    // Keys queued or marked for requeue-on-done. At most one instance of a
    // key is ever queued.
    dirty: HashSet<K>,
    // Keys currently handed out to a worker.
    processing: HashSet<K>,
    delayed: BinaryHeap<DelayedEntry<K>>,
    failures: HashMap<K, u32>,
    next_seq: u64,
    shutdown: bool,
}

struct DelayedEntry<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

// Min-heap on (ready_at, seq). Keys themselves need no ordering.
impl<K> Ord for DelayedEntry<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.ready_at, other.seq).cmp(&(self.ready_at, self.seq))
    }
}
impl<K> PartialOrd for DelayedEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> PartialEq for DelayedEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}
impl<K> Eq for DelayedEntry<K> {}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BinaryHeap::new(),
                failures: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key.
    ///
    /// No-op if the key is already queued; if the key is in flight it is
    /// marked dirty and re-enqueued once its worker calls [`Self::done`].
    pub fn add(&self, key: K) {
        let mut q = self.lock();
        if q.admit(key) {
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after its per-key exponential back-off, and increment
    /// the key's failure count.
    pub fn add_rate_limited(&self, key: K) {
        let mut q = self.lock();
        if q.shutdown {
            return;
        }
        let failures = q.failures.entry(key.clone()).or_insert(0);
        let delay = backoff_for(*failures);
        *failures += 1;
        let seq = q.next_seq;
        q.next_seq += 1;
        q.delayed.push(DelayedEntry {
            ready_at: Instant::now() + delay,
            seq,
            key,
        });
        drop(q);
        // Wake a waiter so it recomputes its sleep deadline.
        self.notify.notify_one();
    }

    /// Wait for the next ready key and mark it in flight.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a concurrent
            // add cannot slip between the check and the await.
            notified.as_mut().enable();

            let deadline = {
                let mut q = self.lock();
                q.admit_due(Instant::now());
                if let Some(key) = q.ready.pop_front() {
                    q.dirty.remove(&key);
                    q.processing.insert(key.clone());
                    return Some(key);
                }
                if q.shutdown {
                    return None;
                }
                q.delayed.peek().map(|e| e.ready_at)
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Declare in-flight work for a key complete; a dirty key is re-enqueued.
    pub fn done(&self, key: &K) {
        let mut q = self.lock();
        q.processing.remove(key);
        if q.dirty.contains(key) {
            q.ready.push_back(key.clone());
            drop(q);
            self.notify.notify_one();
        }
    }

    /// Reset the key's failure count.
    ///
    /// Call on successful completion and on permanent failures, otherwise the
    /// key's back-off grows without bound.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of failures recorded for the key since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Approximate number of ready items.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// True when no items are ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject further adds and wake all waiters. Ready items continue to be
    /// handed out until the queue drains.
    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K> Inner<K>
where
    K: Clone + Eq + Hash,
{
    // Returns true when the key was placed on the ready list.
    fn admit(&mut self, key: K) -> bool {
        if self.shutdown || self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // Requeued by done().
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn admit_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .map(|e| e.ready_at <= now)
            .unwrap_or(false)
        {
            let entry = self.delayed.pop().expect("peeked entry");
            self.admit(entry.key);
        }
    }
}

fn backoff_for(failures: u32) -> Duration {
    // 5ms << 28 already exceeds the 1000s ceiling.
    let exp = failures.min(28);
    (BASE_DELAY * 2u32.pow(exp)).min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn timeout<F: std::future::Future>(fut: F) -> tokio::time::Timeout<F> {
        tokio::time::timeout(Duration::from_secs(5), fut)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(5));
        assert_eq!(backoff_for(1), Duration::from_millis(10));
        assert_eq!(backoff_for(10), Duration::from_millis(5120));
        assert_eq!(backoff_for(30), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn add_deduplicates_queued_keys() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        q.done(&"a");
        q.done(&"b");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_key_is_never_handed_out_twice() {
        let q = Arc::new(WorkQueue::new());
        q.add("a");
        assert_eq!(q.get().await, Some("a"));

        // Re-added while in flight: not ready until done.
        q.add("a");
        assert!(timeout(q.get()).await.is_err());

        q.done(&"a");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(timeout(q.get()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn adds_while_in_flight_coalesce_to_one_requeue() {
        let q = WorkQueue::new();
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        q.add("a");
        q.add("a");
        q.add("a");
        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_admission_backs_off_per_key() {
        let q = WorkQueue::new();

        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.len(), 0);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(start.elapsed(), Duration::from_millis(5));
        q.done(&"a");

        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(start.elapsed(), Duration::from_millis(10));
        q.done(&"a");
        assert_eq!(q.num_requeues(&"a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_backoff() {
        let q = WorkQueue::new();
        q.add_rate_limited("a");
        q.get().await;
        q.done(&"a");
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);

        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_ready_items_then_wakes() {
        let q = Arc::new(WorkQueue::new());
        q.add("a");
        q.add("b");
        q.shut_down();
        // Adds after shutdown are rejected.
        q.add("c");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_blocked_getters() {
        let q = Arc::new(WorkQueue::<&str>::new());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        // Let the waiter block.
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(timeout(waiter).await.unwrap().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_getters_each_receive_distinct_keys() {
        let q = Arc::new(WorkQueue::new());
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        q.add("a");
        q.add("b");
        let mut got = Vec::new();
        for w in workers {
            got.push(timeout(w).await.unwrap().unwrap().unwrap());
        }
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
    }
}
