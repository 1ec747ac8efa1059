//! WebSocket ingress: accept loop, per-connection tasks, broadcast and
//! shutdown.
//!
//! Each connection gets a reader loop and a writer task joined by a bounded
//! channel. Nothing outside the writer touches the socket, so a slow client
//! shows up as a full channel, is counted as a send failure, and is evicted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use glowconf::{BindConfig, InfraConfig, LimitsConfig};
use glowproto::{Message, CLOSE_GOING_AWAY, CLOSE_NORMAL, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify;
use crate::dispatch::{MessageHandler, Router};
use crate::error::{Result, ServerError};
use crate::frames::spawn_frame_loop;
use crate::heartbeat::{spawn_heartbeat_task, HeartbeatMonitor};
use crate::metrics::{spawn_metrics_task, ServerMetrics};
use crate::queue::{DispatchQueue, QueueItem};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, Outbound};
use crate::stage::Stage;

/// Frames buffered per connection before it counts as backlogged.
pub const OUTBOUND_CAPACITY: usize = 256;

pub const SHUTDOWN_REASON: &str = "server shutting down";
pub const SEND_FAILED_REASON: &str = "send failed";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const TRANSPORT_LIMIT_FACTOR: usize = 4;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub classify_prefix_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: glowproto::MAX_FRAME_BYTES,
            classify_prefix_bytes: glowproto::CLASSIFY_PREFIX_BYTES,
        }
    }
}

impl Limits {
    /// Transport limits for accepted sockets. Messages up to
    /// `TRANSPORT_LIMIT_FACTOR` times the frame limit are read and refused
    /// with an `error`; anything larger drops the connection.
    pub fn transport_config(&self) -> WebSocketConfig {
        let cap = self.max_frame_bytes.saturating_mul(TRANSPORT_LIMIT_FACTOR);
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(cap);
        config.max_frame_size = Some(cap);
        config
    }
}

impl From<&LimitsConfig> for Limits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            classify_prefix_bytes: config.classify_prefix_bytes,
        }
    }
}

/// Shared state behind every connection task.
pub struct Ingress {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    queue: Arc<DispatchQueue>,
    router: Router,
    limits: Limits,
}

impl Ingress {
    pub fn new(infra: &InfraConfig, handler: Arc<dyn MessageHandler>) -> Result<Arc<Self>> {
        let metrics = Arc::new(ServerMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let queue = Arc::new(DispatchQueue::new(infra.queue.capacity));
        let router = Router::new(registry.clone(), metrics.clone(), queue.clone(), handler)?;
        Ok(Arc::new(Self {
            registry,
            metrics,
            queue,
            router,
            limits: Limits::from(&infra.limits),
        }))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Handle one inbound text frame.
    ///
    /// Oversize frames are refused before anything looks inside them.
    /// High-frequency frames are queued and get no reply; everything else is
    /// parsed and answered here.
    pub fn on_message(&self, conn: &Connection, raw: String) -> Option<Message> {
        self.metrics.record_received();

        if raw.len() > self.limits.max_frame_bytes {
            self.metrics.record_rejected();
            warn!(
                conn.id = %conn.id,
                size = raw.len(),
                limit = self.limits.max_frame_bytes,
                "Rejected oversize frame"
            );
            return Some(Message::error(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                raw.len(),
                self.limits.max_frame_bytes
            )));
        }

        if classify::is_high_frequency(&raw, self.limits.classify_prefix_bytes) {
            self.queue.enqueue_raw(raw, Some(conn.id));
            return None;
        }

        self.router
            .handle_raw(Some(conn), &raw, self.limits.max_frame_bytes)
    }

    /// Consumer side of the queue: same routing as the direct path, with the
    /// reply going to the sender if it is still connected.
    pub fn dispatch_queued(&self, item: QueueItem) {
        let conn = item.conn.and_then(|id| self.registry.get(&id));
        let reply = self
            .router
            .handle_raw(conn.as_deref(), &item.raw, self.limits.max_frame_bytes);
        if let (Some(reply), Some(conn)) = (reply, conn) {
            self.send(&conn, &reply);
        }
    }

    /// Send to one connection, evicting it if the frame cannot be queued.
    pub fn send(&self, conn: &Connection, message: &Message) -> bool {
        match conn.send(message) {
            Ok(()) => {
                self.metrics.record_sent();
                true
            }
            Err(failure) => {
                self.metrics.record_send_failure();
                if self.registry.evict(&conn.id, CLOSE_NORMAL, SEND_FAILED_REASON) {
                    warn!(conn.id = %conn.id, %failure, "Send failed, closing connection");
                }
                false
            }
        }
    }

    /// Send to every open connection. Returns how many accepted the frame;
    /// the rest are closed and evicted.
    pub fn broadcast(&self, message: &Message) -> usize {
        let text: Arc<str> = match message.to_json() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                error!(kind = %message.kind(), error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            match conn.send_text(text.clone()) {
                Ok(()) => {
                    self.metrics.record_sent();
                    delivered += 1;
                }
                Err(failure) => {
                    self.metrics.record_send_failure();
                    if self.registry.evict(&conn.id, CLOSE_NORMAL, SEND_FAILED_REASON) {
                        warn!(conn.id = %conn.id, %failure, "Broadcast failed, closing connection");
                    }
                }
            }
        }
        delivered
    }

    pub fn evict(&self, id: &ConnectionId, code: u16, reason: &str) -> bool {
        self.registry.evict(id, code, reason)
    }
}

fn welcome(conn: &Connection) -> Message {
    Message::Connected {
        version: PROTOCOL_VERSION.to_string(),
        status: "ok".to_string(),
        connection_id: Some(conn.id.to_string()),
    }
}

/// Bind the listener, retrying a bounded number of times.
pub async fn bind_listener(bind: &BindConfig) -> Result<TcpListener> {
    let addr = bind.address();
    let attempts = bind.retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpListener::bind(&addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < attempts => {
                warn!(
                    %addr,
                    attempt,
                    attempts,
                    error = %e,
                    "Bind failed, retrying in {:?}",
                    bind.retry_delay()
                );
                tokio::time::sleep(bind.retry_delay()).await;
            }
            Err(source) => {
                return Err(ServerError::Bind {
                    addr,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}

/// A running server. Call [`ServerHandle::shutdown`] to stop it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    ingress: Arc<Ingress>,
    stage: Option<Arc<Stage>>,
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
    listener: CancellationToken,
    accept: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ingress(&self) -> &Arc<Ingress> {
        &self.ingress
    }

    pub fn stage(&self) -> Option<&Arc<Stage>> {
        self.stage.as_ref()
    }

    /// Stop background tasks, stop the queue, close every client with 1001,
    /// then stop the listener.
    pub async fn shutdown(self) {
        let ServerHandle {
            ingress,
            stage,
            background,
            tasks,
            consumer,
            listener,
            mut accept,
            ..
        } = self;

        info!("Shutting down WebSocket server");
        background.cancel();
        for task in tasks {
            let _ = task.await;
        }

        ingress.queue().stop();
        let _ = consumer.await;

        let closed = ingress.registry().close_all(CLOSE_GOING_AWAY, SHUTDOWN_REASON);
        debug!(closed, "Closed client connections");

        listener.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut accept).await.is_err() {
            warn!("Listener did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            accept.abort();
        }

        if let Some(stage) = stage {
            stage.host().dispose_all();
        }
        info!("WebSocket server stopped");
    }
}

/// Bind and start every server task. Without a stage no frames are
/// published.
pub async fn serve(
    infra: &InfraConfig,
    ingress: Arc<Ingress>,
    stage: Option<Arc<Stage>>,
) -> Result<ServerHandle> {
    let listener = bind_listener(&infra.bind).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "WebSocket server listening");

    let background = CancellationToken::new();
    let mut tasks = vec![
        spawn_heartbeat_task(
            HeartbeatMonitor::new(
                ingress.registry().clone(),
                ingress.metrics().clone(),
                infra.heartbeat.interval(),
                infra.heartbeat.timeout(),
            ),
            background.child_token(),
        ),
        spawn_metrics_task(
            ingress.metrics().clone(),
            ingress.registry().clone(),
            ingress.queue().clone(),
            infra.metrics.interval(),
            background.child_token(),
        ),
    ];
    if let Some(stage) = &stage {
        tasks.push(spawn_frame_loop(
            stage.clone(),
            ingress.clone(),
            infra.scripting.frame_interval(),
            background.child_token(),
        ));
    }

    let consumer = {
        let queue = ingress.queue().clone();
        let ingress = ingress.clone();
        queue.spawn_consumer(move |item| ingress.dispatch_queued(item))
    };

    let listener_token = CancellationToken::new();
    let accept = tokio::spawn(accept_loop(listener, ingress.clone(), listener_token.clone()));

    Ok(ServerHandle {
        local_addr,
        ingress,
        stage,
        background,
        tasks,
        consumer,
        listener: listener_token,
        accept,
    })
}

async fn accept_loop(listener: TcpListener, ingress: Arc<Ingress>, cancel: CancellationToken) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(handle_connection(stream, addr, ingress.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    // let writers flush their close frames
    while connections.join_next().await.is_some() {}
    debug!("accept loop finished");
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ingress: Arc<Ingress>) {
    let handshake = accept_async_with_config(stream, Some(ingress.limits().transport_config()));
    let ws = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(%addr, "WebSocket handshake timed out");
            return;
        }
    };

    let (conn, outbound) = Connection::new(addr, OUTBOUND_CAPACITY);
    ingress.registry().insert(conn.clone());
    info!(conn.id = %conn.id, %addr, "Client connected");

    let (sink, mut frames) = ws.split();
    let writer = tokio::spawn(write_loop(sink, outbound, conn.clone()));

    ingress.send(&conn, &welcome(&conn));

    loop {
        tokio::select! {
            _ = conn.closed().cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(reply) = ingress.on_message(&conn, text) {
                        ingress.send(&conn, &reply);
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    ingress.metrics().record_received();
                    ingress.send(&conn, &Message::error("binary frames are not supported"));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(conn.id = %conn.id, ?frame, "Client sent close");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn.id = %conn.id, error = %e, "Read failed");
                    break;
                }
                None => break,
            }
        }
    }

    if ingress.registry().remove(&conn.id).is_some() {
        info!(conn.id = %conn.id, "Client disconnected");
    }
    conn.closed().cancel();
    let _ = writer.await;
}

async fn write_loop(mut sink: WsSink, mut outbound: mpsc::Receiver<Outbound>, conn: Arc<Connection>) {
    loop {
        // queued frames go out before the close
        let next = tokio::select! {
            biased;
            out = outbound.recv() => out,
            _ = conn.closed().cancelled() => None,
        };

        let Some(Outbound::Text(text)) = next else {
            break;
        };
        if let Err(e) = sink.send(WsMessage::Text(text.to_string())).await {
            debug!(conn.id = %conn.id, error = %e, "Write failed");
            conn.closed().cancel();
            break;
        }
    }

    if let Some(Outbound::Close { code, reason }) = conn.take_close() {
        let close = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        if let Err(e) = sink.send(WsMessage::Close(Some(close))).await {
            debug!(conn.id = %conn.id, error = %e, "Close frame not delivered");
        }
    }
    let _ = sink.close().await;
}
