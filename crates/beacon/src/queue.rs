//! Bounded queue between socket readers and the high-frequency handler.
//!
//! Readers call [`DispatchQueue::enqueue_raw`], which never waits. When the
//! queue is full the oldest item is dropped: high-frequency frames are state
//! snapshots, so a newer one supersedes it. One consumer task drains the
//! queue in FIFO order across all connections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::ConnectionId;

/// A raw inbound frame waiting for the consumer.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub raw: String,
    pub conn: Option<ConnectionId>,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub depth: usize,
}

#[derive(Debug)]
pub struct DispatchQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    ready: Notify,
    stopped: AtomicBool,
    enqueued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            stopped: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a frame without blocking. Returns false once the queue is stopped.
    pub fn enqueue_raw(&self, raw: String, conn: Option<ConnectionId>) -> bool {
        if self.is_stopped() {
            return false;
        }
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                items.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, capacity = self.capacity, "Dispatch queue full, dropping oldest");
                }
            }
            items.push_back(QueueItem {
                raw,
                conn,
                enqueued_at: Instant::now(),
            });
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        true
    }

    /// Next item in FIFO order, or `None` once stopped.
    pub async fn next(&self) -> Option<QueueItem> {
        loop {
            let notified = self.ready.notified();
            if self.is_stopped() {
                return None;
            }
            if let Some(item) = self.lock().pop_front() {
                return Some(item);
            }
            notified.await;
        }
    }

    pub fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop accepting and wake the consumer. Pending items are discarded and
    /// counted as dropped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let discarded = {
            let mut items = self.lock();
            let n = items.len();
            items.clear();
            n
        };
        self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        self.ready.notify_waiters();
        self.ready.notify_one();
        debug!(discarded, "Dispatch queue stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth: self.lock().len(),
        }
    }

    /// Run `handle` on every item until the queue is stopped.
    pub fn spawn_consumer<F>(self: &Arc<Self>, mut handle: F) -> JoinHandle<()>
    where
        F: FnMut(QueueItem) + Send + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.next().await {
                handle(item);
                queue.mark_processed();
            }
            debug!("Dispatch consumer finished");
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drops_oldest_when_full() {
        let queue = DispatchQueue::new(2);
        for raw in ["a", "b", "c"] {
            assert!(queue.enqueue_raw(raw.to_string(), None));
        }
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.depth, 2);

        let remaining: Vec<String> = queue.lock().iter().map(|i| i.raw.clone()).collect();
        assert_eq!(remaining, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn consumer_sees_fifo_order() {
        let queue = Arc::new(DispatchQueue::new(16));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = queue.spawn_consumer(move |item| {
            let _ = tx.send(item.raw);
        });

        for raw in ["1", "2", "3"] {
            queue.enqueue_raw(raw.to_string(), None);
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(seen, vec!["1", "2", "3"]);

        queue.stop();
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.stats().processed, 3);
    }

    #[tokio::test]
    async fn stopped_queue_refuses_and_ends_consumer() {
        let queue = Arc::new(DispatchQueue::new(4));
        let consumer = queue.spawn_consumer(|_| {});
        queue.stop();
        assert!(!queue.enqueue_raw("late".into(), None));
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.next().await.is_none());
    }
}
