//! JSON frames exchanged over the control-plane WebSocket.
//!
//! Every frame is an object with a `type` field. [`Message`] is the typed
//! view; [`MessageKind`] is its fieldless discriminant, used for routing
//! tables and for classifying raw frames without parsing them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::AudioState;
use crate::entity::{EntityData, ZoneConfigPatch};

/// How a zone should be drawn by the downstream renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Solid blocks placed in the world.
    #[default]
    Blocks,
    /// Lightweight particles, no collision.
    Particles,
    /// Blocks for the loudest band, particles for the rest.
    Hybrid,
}

/// Catalog entry as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub static_camera: bool,
    pub suggested_count: u32,
}

/// Connection and throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsMetrics {
    pub total_connects: u64,
    pub total_disconnects: u64,
    pub active_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_failures: u64,
    #[serde(default)]
    pub rejected_frames: u64,
    #[serde(default)]
    pub queue_depth: u64,
    #[serde(default)]
    pub queue_processed: u64,
    #[serde(default)]
    pub queue_dropped: u64,
}

/// Every frame type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // === Session ===
    /// Welcome sent right after accept.
    Connected {
        version: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    GetWsMetrics,
    WsMetrics(WsMetrics),

    // === Zone control ===
    SetPattern {
        zone: String,
        pattern: String,
    },
    SetZoneConfig {
        zone: String,
        config: ZoneConfigPatch,
    },
    SetRenderMode {
        zone: String,
        mode: RenderMode,
    },
    TriggerEffect {
        zone: String,
        effect: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intensity: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    GetPatterns,
    Patterns {
        patterns: Vec<PatternSummary>,
    },

    // === High-frequency telemetry ===
    BatchUpdate {
        zone: String,
        entities: Vec<EntityData>,
    },
    AudioState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
        state: AudioState,
    },

    // === Server output ===
    Entities {
        zone: String,
        frame: u64,
        entities: Vec<EntityData>,
    },
    Ack {
        request: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Fieldless discriminant of [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Connected,
    Ping,
    Pong,
    GetWsMetrics,
    WsMetrics,
    SetPattern,
    SetZoneConfig,
    SetRenderMode,
    TriggerEffect,
    GetPatterns,
    Patterns,
    BatchUpdate,
    AudioState,
    Entities,
    Ack,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        MessageKind::Connected,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::GetWsMetrics,
        MessageKind::WsMetrics,
        MessageKind::SetPattern,
        MessageKind::SetZoneConfig,
        MessageKind::SetRenderMode,
        MessageKind::TriggerEffect,
        MessageKind::GetPatterns,
        MessageKind::Patterns,
        MessageKind::BatchUpdate,
        MessageKind::AudioState,
        MessageKind::Entities,
        MessageKind::Ack,
        MessageKind::Error,
    ];

    /// Wire name carried in the `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connected => "connected",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::GetWsMetrics => "get_ws_metrics",
            MessageKind::WsMetrics => "ws_metrics",
            MessageKind::SetPattern => "set_pattern",
            MessageKind::SetZoneConfig => "set_zone_config",
            MessageKind::SetRenderMode => "set_render_mode",
            MessageKind::TriggerEffect => "trigger_effect",
            MessageKind::GetPatterns => "get_patterns",
            MessageKind::Patterns => "patterns",
            MessageKind::BatchUpdate => "batch_update",
            MessageKind::AudioState => "audio_state",
            MessageKind::Entities => "entities",
            MessageKind::Ack => "ack",
            MessageKind::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Superseding state snapshots sent at a high rate. These take the
    /// queued path so parsing never stalls the socket task.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, MessageKind::BatchUpdate | MessageKind::AudioState)
    }

    /// Kinds a client may send to the server.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            MessageKind::Ping
                | MessageKind::Pong
                | MessageKind::GetWsMetrics
                | MessageKind::SetPattern
                | MessageKind::SetZoneConfig
                | MessageKind::SetRenderMode
                | MessageKind::TriggerEffect
                | MessageKind::GetPatterns
                | MessageKind::BatchUpdate
                | MessageKind::AudioState
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a raw frame could not become a [`Message`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    Oversize { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Connected { .. } => MessageKind::Connected,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::GetWsMetrics => MessageKind::GetWsMetrics,
            Message::WsMetrics(_) => MessageKind::WsMetrics,
            Message::SetPattern { .. } => MessageKind::SetPattern,
            Message::SetZoneConfig { .. } => MessageKind::SetZoneConfig,
            Message::SetRenderMode { .. } => MessageKind::SetRenderMode,
            Message::TriggerEffect { .. } => MessageKind::TriggerEffect,
            Message::GetPatterns => MessageKind::GetPatterns,
            Message::Patterns { .. } => MessageKind::Patterns,
            Message::BatchUpdate { .. } => MessageKind::BatchUpdate,
            Message::AudioState { .. } => MessageKind::AudioState,
            Message::Entities { .. } => MessageKind::Entities,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    /// Parse a text frame, refusing anything over `limit` bytes before
    /// looking at its contents.
    pub fn parse(raw: &str, limit: usize) -> Result<Self, ProtocolError> {
        if raw.len() > limit {
            return Err(ProtocolError::Oversize {
                size: raw.len(),
                limit,
            });
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn ping_now() -> Self {
        Message::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn ack(request: MessageKind, zone: Option<&str>) -> Self {
        Message::Ack {
            request: request.as_str().to_string(),
            zone: zone.map(str::to_string),
        }
    }
}

/// Milliseconds since the Unix epoch, as carried by ping/pong.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_kind_round_trips_its_wire_name() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire("nope"), None);
    }

    #[test]
    fn wire_names_match_serde_tags() {
        let samples = vec![
            Message::Connected {
                version: "1".into(),
                status: "ok".into(),
                connection_id: None,
            },
            Message::Ping { timestamp: 1 },
            Message::Pong { timestamp: 1 },
            Message::GetWsMetrics,
            Message::WsMetrics(WsMetrics::default()),
            Message::SetPattern {
                zone: "z".into(),
                pattern: "p".into(),
            },
            Message::SetZoneConfig {
                zone: "z".into(),
                config: ZoneConfigPatch::default(),
            },
            Message::SetRenderMode {
                zone: "z".into(),
                mode: RenderMode::Particles,
            },
            Message::TriggerEffect {
                zone: "z".into(),
                effect: "flash".into(),
                intensity: None,
                duration_ms: None,
            },
            Message::GetPatterns,
            Message::Patterns { patterns: vec![] },
            Message::BatchUpdate {
                zone: "z".into(),
                entities: vec![],
            },
            Message::AudioState {
                zone: None,
                state: AudioState::default(),
            },
            Message::Entities {
                zone: "z".into(),
                frame: 0,
                entities: vec![],
            },
            Message::ack(MessageKind::SetPattern, Some("z")),
            Message::error("bad"),
        ];
        assert_eq!(samples.len(), MessageKind::ALL.len());

        for msg in samples {
            let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["type"], msg.kind().as_str());
        }
    }

    #[test]
    fn parse_rejects_oversize_before_json() {
        let raw = format!("{{\"type\":\"ping\",\"timestamp\":1,\"pad\":\"{}\"}}", "x".repeat(64));
        let err = Message::parse(&raw, 32).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversize { limit: 32, .. }));
    }

    #[test]
    fn parse_reports_malformed() {
        assert!(matches!(
            Message::parse("{not json", 1024),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Message::parse(r#"{"type":"unknown_thing"}"#, 1024),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn ws_metrics_fields_are_flat_on_the_wire() {
        let msg = Message::WsMetrics(WsMetrics {
            active_connections: 3,
            ..Default::default()
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ws_metrics");
        assert_eq!(json["active_connections"], 3);
    }

    #[test]
    fn partial_zone_config_parses() {
        let msg = Message::parse(
            r#"{"type":"set_zone_config","zone":"main","config":{"entity_count":32}}"#,
            1024,
        )
        .unwrap();
        match msg {
            Message::SetZoneConfig { zone, config } => {
                assert_eq!(zone, "main");
                assert_eq!(config.entity_count, Some(32));
                assert_eq!(config.max_scale, None);
            }
            other => panic!("Expected SetZoneConfig, got {:?}", other),
        }
    }

    #[test]
    fn high_frequency_kinds_are_inbound() {
        for kind in MessageKind::ALL {
            if kind.is_high_frequency() {
                assert!(kind.is_inbound());
            }
        }
    }
}
