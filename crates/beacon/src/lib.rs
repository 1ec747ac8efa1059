//! beacon - WebSocket control plane for Glow
//!
//! This library provides:
//! - `server`: accept loop, per-connection tasks, broadcast, shutdown
//! - `registry`: open connections and their liveness
//! - `heartbeat`: ping sweeps and silent-peer eviction
//! - `classify`: prefix-window frame classification
//! - `queue`: bounded drop-oldest queue for high-frequency frames
//! - `dispatch`: route table and session replies
//! - `stage`: zone directory driven by control commands
//! - `frames`: frame loop publishing pattern output
//! - `metrics`: connection and throughput counters
//! - `telemetry`: tracing and optional OTLP export

pub mod classify;
pub mod dispatch;
pub mod error;
pub mod frames;
pub mod heartbeat;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod server;
pub mod stage;
pub mod telemetry;

pub use dispatch::{default_routes, MessageHandler, Route, Router};
pub use error::{Result, ServerError, StageError};
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use metrics::ServerMetrics;
pub use queue::{DispatchQueue, QueueItem, QueueStats};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use server::{bind_listener, serve, Ingress, Limits, ServerHandle};
pub use stage::{FramePlan, FrameSource, Stage, Zone};
