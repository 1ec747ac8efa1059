//! glowproto - data model and wire protocol for Glow
//!
//! Glow turns a live audio-feature stream into positioned, scaled entities
//! while operators steer zones over a WebSocket control plane. This crate
//! holds the types every other crate agrees on:
//!
//! - [`AudioState`]: one tick of analysed audio (five bands, amplitude, beat)
//! - [`PatternConfig`]: per-zone tuning handed to a pattern every frame
//! - [`EntityData`]: one renderable point produced by a pattern
//! - [`Message`]: the JSON frames on the control-plane socket
//!
//! ## Frame rules
//!
//! Frames are JSON text with a `type` field. Frames above
//! [`MAX_FRAME_BYTES`] are refused before parsing. Servers classify frames by
//! looking only at the first [`CLASSIFY_PREFIX_BYTES`] bytes so that a
//! `type`-like string buried in a payload cannot reroute a message.

pub mod audio;
pub mod entity;
pub mod message;

pub use audio::{AudioState, BAND_COUNT};
pub use entity::{EntityData, PatternConfig, ZoneConfigPatch, MAX_ENTITY_COUNT};
pub use message::{
    now_millis, Message, MessageKind, PatternSummary, ProtocolError, RenderMode, WsMetrics,
};

/// Largest inbound frame accepted by default (256 KiB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Leading bytes inspected when classifying a raw frame.
pub const CLASSIFY_PREFIX_BYTES: usize = 60;

/// WebSocket close code for normal closure, heartbeat timeout and eviction.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code for deliberate server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Version string sent in the `connected` welcome.
pub const PROTOCOL_VERSION: &str = concat!("glow/", env!("CARGO_PKG_VERSION"));
