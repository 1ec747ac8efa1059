//! Open connections and their liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use glowproto::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::ServerMetrics;

pub type ConnectionId = Uuid;

/// Frames for a connection's writer task. Text travels through the bounded
/// channel; the close frame is held on the [`Connection`] so a full channel
/// cannot drop it.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<str>),
    Close { code: u16, reason: String },
}

/// Why an outbound frame could not be handed to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The writer is not keeping up.
    Backlogged,
    /// The writer has stopped.
    Closed,
    /// The message could not be serialized.
    Encode,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SendFailure::Backlogged => "outbound queue full",
            SendFailure::Closed => "connection closed",
            SendFailure::Encode => "failed to encode message",
        })
    }
}

/// One accepted WebSocket peer.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    last_pong: Mutex<Instant>,
    outbound: mpsc::Sender<Outbound>,
    pending_close: Mutex<Option<(u16, String)>>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end its writer task drains.
    pub fn new(addr: SocketAddr, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            connected_at: Utc::now(),
            last_pong: Mutex::new(Instant::now()),
            outbound: tx,
            pending_close: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    pub fn send_text(&self, text: Arc<str>) -> Result<(), SendFailure> {
        if self.closed.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        self.outbound
            .try_send(Outbound::Text(text))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendFailure::Backlogged,
                mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
            })
    }

    pub fn send(&self, message: &Message) -> Result<(), SendFailure> {
        let text = message.to_json().map_err(|_| SendFailure::Encode)?;
        self.send_text(Arc::from(text))
    }

    /// Record a close frame for the writer and stop the connection's tasks.
    /// Only the first close is kept.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut pending = self.pending_close.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.is_cancelled() {
                return;
            }
            *pending = Some((code, reason.into()));
        }
        self.closed.cancel();
    }

    /// The close frame recorded by [`Connection::close`], at most once.
    pub fn take_close(&self) -> Option<Outbound> {
        self.pending_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|(code, reason)| Outbound::Close { code, reason })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from either side.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn record_pong_at(&self, now: Instant) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn record_pong(&self) {
        self.record_pong_at(Instant::now());
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last pong, as seen at `now`.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_pong())
    }
}

/// Concurrency-safe map of open connections.
///
/// Every connection is removed at most once whatever closed it, so the
/// disconnect counter matches the connect counter.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    metrics: Arc<ServerMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id, conn);
        self.metrics.record_connect();
    }

    /// Remove a connection. Returns it only for the first caller.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_some() {
            self.metrics.record_disconnect();
        }
        removed
    }

    /// Remove and close. False when another path already evicted it.
    pub fn evict(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        match self.remove(id) {
            Some(conn) => {
                conn.close(code, reason);
                true
            }
            None => false,
        }
    }

    /// Close every connection, returning how many were open.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            self.metrics.record_disconnect();
            conn.close(code, reason);
        }
        drained.len()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy, so callers never hold the lock while sending.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
