//! Application-level liveness for WebSocket clients.
//!
//! Every interval each connection is sent a `ping` carrying a millisecond
//! timestamp and is expected to answer with a `pong`. A connection silent for
//! longer than the timeout is closed with code 1000. A connection whose ping
//! cannot be queued is closed the same way. Either path removes it from the
//! registry exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glowproto::{Message, CLOSE_NORMAL};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionRegistry, SendFailure};

pub const TIMEOUT_REASON: &str = "heartbeat timeout";
pub const SEND_FAILED_REASON: &str = "heartbeat send failed";

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub timed_out: usize,
    pub send_failed: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ServerMetrics>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            interval,
            timeout,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check every connection once, as seen at `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let ping: Option<Arc<str>> = Message::ping_now().to_json().ok().map(Arc::from);

        for conn in self.registry.snapshot() {
            let silent = conn.silent_for(now);
            if silent > self.timeout {
                if self.registry.evict(&conn.id, CLOSE_NORMAL, TIMEOUT_REASON) {
                    info!(
                        conn.id = %conn.id,
                        addr = %conn.addr,
                        silent_ms = silent.as_millis() as u64,
                        "Closing silent connection"
                    );
                    report.timed_out += 1;
                }
                continue;
            }

            let sent = match &ping {
                Some(text) => conn.send_text(text.clone()),
                None => Err(SendFailure::Encode),
            };
            match sent {
                Ok(()) => {
                    self.metrics.record_sent();
                    report.pinged += 1;
                }
                Err(failure) => {
                    self.metrics.record_send_failure();
                    if self.registry.evict(&conn.id, CLOSE_NORMAL, SEND_FAILED_REASON) {
                        warn!(conn.id = %conn.id, %failure, "Heartbeat ping failed, closing");
                        report.send_failed += 1;
                    }
                }
            }
        }

        if report.timed_out + report.send_failed > 0 {
            debug!(?report, "Heartbeat sweep");
        }
        report
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }
}

/// Run sweeps every interval until cancelled.
pub fn spawn_heartbeat_task(monitor: HeartbeatMonitor, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    monitor.sweep();
                }
                _ = cancel.cancelled() => {
                    debug!("heartbeat task shutting down");
                    break;
                }
            }
        }
    })
}
