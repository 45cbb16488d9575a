//! Deduplicating work queue with rate-limited requeue
//!
//! The queue tracks three pieces of state: a pending FIFO of items ready for
//! dispatch, a `dirty` set of items known to need processing, and a
//! `processing` set of items currently held by a worker. Together they give
//! the two guarantees the controller relies on:
//!
//! - an item is never handed to two workers at once, and
//! - notifications arriving while an item is in flight collapse into at most
//!   one re-dispatch after the current pass completes.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::ratelimit::RateLimiter;

struct Inner<T> {
    pending: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Work queue dispatching each item to at most one worker at a time
///
/// The semaphore carries exactly one permit per pending item, so `get` can
/// wait without polling and `shut_down` can wake every blocked worker by
/// closing it.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Semaphore,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue that requeues failures through `limiter`
    pub fn new(limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            ready: Semaphore::new(0),
            limiter,
        }
    }

    /// Mark an item as needing processing
    ///
    /// Already-dirty items are absorbed. Items currently being processed are
    /// only marked; they re-enter the pending FIFO when the worker calls
    /// [`done`](Self::done).
    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.shutting_down || inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            return;
        }
        inner.pending.push_back(item);
        drop(inner);
        self.ready.add_permits(1);
    }

    /// Re-add an item after the delay computed by the rate limiter
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.limiter.when(&item);
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear rate-limit tracking for an item after a successful sync
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    /// Number of failures recorded for an item
    pub fn retries(&self, item: &T) -> u32 {
        self.limiter.retries(item)
    }

    /// Wait for the next item, or `None` once the queue has shut down
    ///
    /// The returned item is held by the calling worker until it reports
    /// [`done`](Self::done); the same item is never handed out twice
    /// concurrently.
    pub async fn get(&self) -> Option<T> {
        let permit = self.ready.acquire().await.ok()?;
        permit.forget();
        let mut inner = self.inner.lock();
        let item = inner.pending.pop_front()?;
        inner.dirty.remove(&item);
        inner.processing.insert(item.clone());
        Some(item)
    }

    /// Report that processing of an item finished
    ///
    /// If the item was re-added while in flight it goes straight back into
    /// the pending FIFO.
    pub fn done(&self, item: &T) {
        let mut inner = self.inner.lock();
        inner.processing.remove(item);
        if inner.dirty.contains(item) && !inner.shutting_down {
            inner.pending.push_back(item.clone());
            drop(inner);
            self.ready.add_permits(1);
        }
    }

    /// Shut the queue down: blocked `get`s return `None` immediately and
    /// subsequent `add`s are dropped
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.ready.close();
    }

    /// Number of items waiting for dispatch
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether no items are waiting for dispatch
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::ratelimit::{default_controller_rate_limiter, ItemExponentialBackoff};
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(Box::new(default_controller_rate_limiter())))
    }

    #[tokio::test]
    async fn duplicate_adds_collapse_while_pending() {
        let q = queue();
        q.add("csr-1".to_string());
        q.add("csr-1".to_string());
        q.add("csr-1".to_string());

        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("csr-1".to_string()));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_during_processing_dispatches_once_after_done() {
        let q = queue();
        q.add("csr-1".to_string());
        let item = q.get().await.expect("one pending item");

        // while in flight, further notifications only mark it dirty
        q.add("csr-1".to_string());
        q.add("csr-1".to_string());
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("csr-1".to_string()));
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_redo_does_not_requeue() {
        let q = queue();
        q.add("csr-1".to_string());
        let item = q.get().await.expect("one pending item");
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_waits_until_an_item_arrives() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("csr-1".to_string());
        let got = waiter.await.expect("worker task");
        assert_eq!(got, Some("csr-1".to_string()));
    }

    #[tokio::test]
    async fn shutdown_unblocks_waiting_workers() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.expect("worker task"), None);

        // adds after shutdown are dropped
        q.add("late".to_string());
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_lands_after_the_backoff_delay() {
        let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new(Box::new(
            ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000)),
        )));

        q.add_rate_limited("csr-1".to_string());
        tokio::task::yield_now().await;
        assert!(q.is_empty(), "item must not appear before the delay");

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("csr-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resets_after_forget() {
        let q: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new(Box::new(
            ItemExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(1000)),
        )));
        let key = "csr-1".to_string();

        q.add_rate_limited(key.clone());
        assert_eq!(q.retries(&key), 1);
        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert_eq!(q.get().await, Some(key.clone()));
        q.forget(&key);
        q.done(&key);
        assert_eq!(q.retries(&key), 0);
    }
}
