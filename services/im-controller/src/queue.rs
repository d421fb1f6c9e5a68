//! Keyed work queue.
//!
//! Guarantees that a key is processed by at most one worker at a time:
//! - A queued key is not queued twice
//! - A key added while a worker holds it is re-queued once that worker
//!   calls [`WorkQueue::done`]
//! - Rate-limited re-adds back off per key until [`WorkQueue::forget`]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use keel_reconcile::BackoffPolicy;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, whether queued or deferred.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        })
    }

    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }

        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }

        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Add `key` after a delay that grows with its consecutive failures.
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures - 1
        };
        self.add_after(key, self.backoff.delay(attempt));
    }

    /// Reset the failure count for `key`.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().await.failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing, re-queueing it if it was added meanwhile.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter: 0.0,
        })
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = queue();
        queue.add("a").await;
        queue.add("a").await;
        queue.add("b").await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_is_not_handed_out_while_processing() {
        let queue = queue();
        queue.add("a").await;
        let key = queue.get().await.unwrap();

        // Re-added while held: deferred until done.
        queue.add("a").await;
        assert!(queue.is_empty().await);

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_rate_limited_adds_count_failures() {
        let queue = queue();
        queue.add_rate_limited("a").await;
        queue.add_rate_limited("a").await;
        assert_eq!(queue.num_requeues("a").await, 2);

        let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(key.as_deref(), Some("a"));

        queue.forget("a").await;
        assert_eq!(queue.num_requeues("a").await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = queue();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }
}
