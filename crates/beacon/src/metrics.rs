//! Connection and throughput counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glowproto::WsMetrics;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::queue::{DispatchQueue, QueueStats};
use crate::registry::ConnectionRegistry;

/// Lock-free counters shared by every connection task.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    total_connects: AtomicU64,
    total_disconnects: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_failures: AtomicU64,
    rejected_frames: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.total_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.total_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connects(&self) -> u64 {
        self.total_connects.load(Ordering::Relaxed)
    }

    pub fn total_disconnects(&self) -> u64 {
        self.total_disconnects.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames.load(Ordering::Relaxed)
    }

    /// Wire view of the counters.
    pub fn snapshot(&self, active_connections: usize, queue: QueueStats) -> WsMetrics {
        WsMetrics {
            total_connects: self.total_connects(),
            total_disconnects: self.total_disconnects(),
            active_connections: active_connections as u64,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures(),
            rejected_frames: self.rejected_frames(),
            queue_depth: queue.depth as u64,
            queue_processed: queue.processed,
            queue_dropped: queue.dropped,
        }
    }
}

/// Log the aggregate counters every `interval` until cancelled.
pub fn spawn_metrics_task(
    metrics: Arc<ServerMetrics>,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<DispatchQueue>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let m = metrics.snapshot(registry.len(), queue.stats());
                    info!(
                        connects = m.total_connects,
                        disconnects = m.total_disconnects,
                        active = m.active_connections,
                        sent = m.messages_sent,
                        received = m.messages_received,
                        send_failures = m.send_failures,
                        rejected = m.rejected_frames,
                        queue_depth = m.queue_depth,
                        queue_dropped = m.queue_dropped,
                        "WebSocket metrics"
                    );
                }
                _ = cancel.cancelled() => {
                    debug!("metrics task shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = ServerMetrics::new();
        metrics.record_connect();
        metrics.record_connect();
        metrics.record_disconnect();
        metrics.record_received();
        metrics.record_send_failure();

        let snap = metrics.snapshot(
            1,
            QueueStats {
                enqueued: 4,
                processed: 3,
                dropped: 1,
                depth: 0,
            },
        );
        assert_eq!(snap.total_connects, 2);
        assert_eq!(snap.total_disconnects, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.send_failures, 1);
        assert_eq!(snap.queue_processed, 3);
        assert_eq!(snap.queue_dropped, 1);
    }
}
