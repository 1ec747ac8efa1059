//! Message routing.
//!
//! Session frames (ping, pong, metrics) are answered here. Zone commands and
//! telemetry go to a [`MessageHandler`]. Frames only the server may send are
//! refused. The route table is checked against every inbound kind when the
//! router is built, so a new message type cannot be silently dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use glowproto::{Message, MessageKind};
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::metrics::ServerMetrics;
use crate::queue::DispatchQueue;
use crate::registry::{Connection, ConnectionRegistry};

/// Where an inbound kind is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered by the router itself.
    Session,
    /// Forwarded to the [`MessageHandler`].
    Handler,
    /// Refused with an `error` reply.
    Reject,
}

/// Application side of the protocol.
pub trait MessageHandler: Send + Sync {
    /// Handle one parsed frame, optionally producing a reply for the sender.
    fn handle(&self, msg: Message) -> Option<Message>;
}

/// Route table used by the server.
pub fn default_routes() -> BTreeMap<MessageKind, Route> {
    MessageKind::ALL
        .iter()
        .map(|kind| {
            let route = match kind {
                MessageKind::Ping | MessageKind::Pong | MessageKind::GetWsMetrics => Route::Session,
                kind if kind.is_inbound() => Route::Handler,
                _ => Route::Reject,
            };
            (*kind, route)
        })
        .collect()
}

pub struct Router {
    routes: BTreeMap<MessageKind, Route>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    queue: Arc<DispatchQueue>,
    handler: Arc<dyn MessageHandler>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ServerMetrics>,
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::with_routes(default_routes(), registry, metrics, queue, handler)
    }

    pub fn with_routes(
        routes: BTreeMap<MessageKind, Route>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ServerMetrics>,
        queue: Arc<DispatchQueue>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        if let Some(kind) = MessageKind::ALL
            .iter()
            .find(|kind| kind.is_inbound() && !routes.contains_key(kind))
        {
            return Err(ServerError::MissingRoute(*kind));
        }
        Ok(Self {
            routes,
            registry,
            metrics,
            queue,
            handler,
        })
    }

    pub fn route(&self, kind: MessageKind) -> Route {
        self.routes.get(&kind).copied().unwrap_or(Route::Reject)
    }

    /// Parse and route a raw frame. Malformed frames produce an `error` reply.
    pub fn handle_raw(&self, conn: Option<&Connection>, raw: &str, limit: usize) -> Option<Message> {
        match Message::parse(raw, limit) {
            Ok(msg) => self.handle(conn, msg),
            Err(e) => {
                debug!(conn.id = ?conn.map(|c| c.id), error = %e, "Rejected frame");
                Some(Message::error(e.to_string()))
            }
        }
    }

    pub fn handle(&self, conn: Option<&Connection>, msg: Message) -> Option<Message> {
        let kind = msg.kind();
        match self.route(kind) {
            Route::Session => self.handle_session(conn, msg),
            Route::Handler => self.handler.handle(msg),
            Route::Reject => Some(Message::error(format!(
                "'{}' is not accepted from clients",
                kind
            ))),
        }
    }

    fn handle_session(&self, conn: Option<&Connection>, msg: Message) -> Option<Message> {
        match msg {
            Message::Ping { timestamp } => Some(Message::Pong { timestamp }),
            Message::Pong { .. } => {
                if let Some(conn) = conn {
                    conn.record_pong();
                }
                None
            }
            Message::GetWsMetrics => Some(Message::WsMetrics(
                self.metrics.snapshot(self.registry.len(), self.queue.stats()),
            )),
            other => self.handler.handle(other),
        }
    }
}
