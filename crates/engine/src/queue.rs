//! Deduplicating work queue with delayed requeue and per-item backoff.
//!
//! Each control loop owns one. Items queue at most once while waiting;
//! popping an item clears its pending mark so events arriving during
//! processing enqueue it again.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

struct Inner<T> {
    ready: VecDeque<T>,
    delayed: BTreeMap<(Instant, u64), T>,
    pending: FxHashSet<T>,
    failures: FxHashMap<T, u32>,
    seq: u64,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                delayed: BTreeMap::new(),
                pending: FxHashSet::default(),
                failures: FxHashMap::default(),
                seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue for immediate processing. An already-delayed item is promoted
    /// so fresh events are never stuck behind a timed requeue; an item that
    /// is already ready stays queued once.
    pub fn add(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.contains(&item) {
                let Some(key) = inner
                    .delayed
                    .iter()
                    .find(|(_, queued)| **queued == item)
                    .map(|(key, _)| *key)
                else {
                    return;
                };
                inner.delayed.remove(&key);
                inner.ready.push_back(item);
            } else {
                inner.pending.insert(item.clone());
                inner.ready.push_back(item);
            }
        }
        self.notify.notify_one();
    }

    /// Enqueue after a delay. No-op while the item is already queued.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.pending.insert(item.clone()) {
                return;
            }
            let seq = inner.seq;
            inner.seq += 1;
            inner.delayed.insert((Instant::now() + delay, seq), item);
        }
        self.notify.notify_one();
    }

    /// Requeue after a failure with exponential backoff.
    pub fn requeue_backoff(&self, item: T) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            let failures = inner.failures.entry(item.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            let exp = BACKOFF_BASE.saturating_mul(1u32 << (*failures - 1).min(16));
            exp.min(BACKOFF_MAX)
        };
        self.add_after(item, delay);
    }

    /// Clear the failure history after a clean pass.
    pub fn forget(&self, item: &T) {
        self.inner.lock().unwrap().failures.remove(item);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next item. Due delayed items are promoted first.
    pub async fn next(&self) -> T {
        loop {
            let wait_until = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                while let Some((&key, _)) = inner.delayed.first_key_value() {
                    if key.0 > now {
                        break;
                    }
                    let item = inner.delayed.remove(&key).unwrap();
                    inner.ready.push_back(item);
                }
                if let Some(item) = inner.ready.pop_front() {
                    inner.pending.remove(&item);
                    return item;
                }
                inner.delayed.first_key_value().map(|(&(when, _), _)| when)
            };

            let notified = self.notify.notified();
            match wait_until {
                Some(when) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(when) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_while_queued() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, "a");
        // Popped items may be enqueued again.
        q.add("a");
        assert_eq!(q.next().await, "b");
        assert_eq!(q.next().await, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_items_fire_in_order() {
        let q = WorkQueue::new();
        q.add_after("slow", Duration::from_secs(5));
        q.add_after("fast", Duration::from_secs(1));
        assert_eq!(q.next().await, "fast");
        assert_eq!(q.next().await, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_items_preempt_delayed() {
        let q = WorkQueue::new();
        q.add_after("later", Duration::from_secs(30));
        q.add("now");
        assert_eq!(q.next().await, "now");
    }

    #[tokio::test(start_paused = true)]
    async fn add_promotes_a_delayed_item() {
        let q = WorkQueue::new();
        q.add_after("x", Duration::from_secs(300));
        let t0 = Instant::now();
        q.add("x");
        assert_eq!(q.next().await, "x");
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_resets() {
        let q = WorkQueue::new();
        let t0 = Instant::now();
        q.requeue_backoff("x");
        assert_eq!(q.next().await, "x");
        assert!(t0.elapsed() >= Duration::from_millis(250));

        let t1 = Instant::now();
        q.requeue_backoff("x");
        assert_eq!(q.next().await, "x");
        assert!(t1.elapsed() >= Duration::from_millis(500));

        q.forget(&"x");
        let t2 = Instant::now();
        q.requeue_backoff("x");
        assert_eq!(q.next().await, "x");
        let elapsed = t2.elapsed();
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(500));
    }
}
