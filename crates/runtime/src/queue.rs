//! Coalescing work queue with per-key in-flight tracking and rate-limited retries.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

/// Exponential backoff with jitter, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max } }

    /// Delay for the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.max);
        let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
        raw.mul_f64(jitter).min(self.max)
    }
}

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    idle: Notify,
    backoff: Backoff,
}

/// At-least-once queue of keys. A key is never handed to two workers at
/// once; adds for an in-flight key are replayed after `done`.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: Backoff) -> Self {
        let state = State {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            processing: FxHashSet::default(),
            dirty: FxHashSet::default(),
            failures: FxHashMap::default(),
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { state: Mutex::new(state), notify: Notify::new(), idle: Notify::new(), backoff }) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<K>> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn add(&self, key: K) {
        let mut st = self.state();
        if st.shutting_down { return; }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.queued.insert(key.clone()) {
            st.order.push_back(key);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Requeue after the backoff for this key's consecutive failure count.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut st = self.state();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = self.inner.backoff.delay(attempt);
        counter!("workqueue_retries", 1u64);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &K) { self.state().failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.state().failures.get(key).copied().unwrap_or(0) }

    /// Next key to process, or `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state();
                if st.shutting_down { return None; }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; a key re-added meanwhile goes back on the queue.
    pub fn done(&self, key: &K) {
        let mut st = self.state();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutting_down && st.queued.insert(key.clone()) {
            st.order.push_back(key.clone());
            drop(st);
            self.inner.notify.notify_one();
            return;
        }
        if st.processing.is_empty() {
            drop(st);
            self.inner.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize { self.state().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.state().processing.len() }

    /// Stop handing out keys. Queued keys are dropped; in-flight keys finish.
    pub fn shut_down(&self) {
        {
            let mut st = self.state();
            st.shutting_down = true;
            st.order.clear();
            st.queued.clear();
            st.dirty.clear();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.state().shutting_down }

    /// Resolves once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.state().processing.is_empty() { return; }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> { WorkQueue::new(Backoff::new(Duration::from_millis(10), Duration::from_millis(80))) }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.in_flight(), 2);
    }

    #[tokio::test]
    async fn adds_while_in_flight_replay_after_done() {
        let q = queue();
        q.add("a");
        let k = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        assert!(q.is_empty(), "in-flight key must not be handed out twice");
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        q.shut_down();
        assert_eq!(worker.await.unwrap(), None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_retries_back_off_and_reset() {
        let q = queue();
        let d1 = q.add_rate_limited("a");
        let d2 = q.add_rate_limited("a");
        let d4 = {
            q.add_rate_limited("a");
            q.add_rate_limited("a")
        };
        assert_eq!(q.failures(&"a"), 4);
        assert!(d1 <= Duration::from_millis(12));
        assert!(d2 >= Duration::from_millis(16));
        assert!(d4 <= Duration::from_millis(80));
        q.forget(&"a");
        assert_eq!(q.failures(&"a"), 0);
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn wait_idle_tracks_in_flight_keys() {
        let q = queue();
        q.add("a");
        let k = q.get().await.unwrap();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());
        q.done(&k);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
