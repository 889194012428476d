//! Keyed serialising work queue with exponential backoff.
//!
//! At most one reconcile is in flight per key; a key re-added while active
//! is marked dirty and runs again once the active pass finishes. Failed
//! keys are re-queued on the backoff schedule until the retry budget is
//! exhausted, then dropped with a warning so one bad key cannot starve the
//! rest.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

use crate::errors::backoff_for;

pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Identity of one tenant object slot. All sync work is keyed and
/// serialised on this triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncKey {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

#[derive(Debug)]
struct QueueState<K> {
    pending: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    retries: HashMap<K, u32>,
    closed: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            retries: HashMap::new(),
            closed: false,
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    max_retries: u32,
}

/// Reported by workers when a key finishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Retry,
    /// Permanent-for-key failure: clear retry state and wait for the next
    /// external event.
    Drop,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_retries,
        })
    }

    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            if state.active.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.pending.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a key finished and schedules follow-up work as needed.
    pub fn done(self: &Arc<Self>, key: K, outcome: Outcome) {
        let requeue_delay = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&key);
            match outcome {
                Outcome::Done | Outcome::Drop => {
                    state.retries.remove(&key);
                    None
                }
                Outcome::Retry => {
                    let attempt = state.retries.entry(key.clone()).or_insert(0);
                    *attempt += 1;
                    if *attempt > self.max_retries {
                        warn!(?key, attempts = *attempt, "retry budget exhausted, dropping key");
                        state.retries.remove(&key);
                        None
                    } else {
                        Some(backoff_for(*attempt - 1))
                    }
                }
            }
        };

        if let Some(delay) = requeue_delay {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.add(key);
            });
            return;
        }

        // A key touched while active runs once more with fresh state.
        let rerun = {
            let mut state = self.state.lock().unwrap();
            state.dirty.remove(&key)
        };
        if rerun {
            self.add(key);
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_active_runs_again() {
        let q: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        q.add("a");
        let key = q.next().await.unwrap();
        // Re-add while in flight: must not appear until done.
        q.add("a");
        assert!(q.is_empty());
        q.done(key, Outcome::Done);
        assert_eq!(q.next().await, Some("a"));
    }

    #[tokio::test]
    async fn retry_requeues_with_backoff() {
        let q: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        q.add("a");
        let key = q.next().await.unwrap();
        q.done(key, Outcome::Retry);
        // First backoff step is 100ms.
        let key = tokio::time::timeout(std::time::Duration::from_secs(2), q.next())
            .await
            .expect("retried key should reappear");
        assert_eq!(key, Some("a"));
    }

    #[tokio::test]
    async fn retry_budget_is_finite() {
        let q: Arc<WorkQueue<&'static str>> = WorkQueue::with_max_retries(1);
        q.add("a");
        let key = q.next().await.unwrap();
        q.done(key, Outcome::Retry);
        let key = tokio::time::timeout(std::time::Duration::from_secs(2), q.next())
            .await
            .unwrap()
            .unwrap();
        q.done(key, Outcome::Retry);
        // Budget exhausted: nothing comes back.
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn close_drains() {
        let q: Arc<WorkQueue<&'static str>> = WorkQueue::new();
        q.add("a");
        q.close();
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, None);
    }
}
