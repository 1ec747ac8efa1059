//! Settings read once at startup: listener, limits, heartbeat, queue,
//! scripting, metrics and telemetry.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Network listener for the control-plane server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindConfig {
    /// Interface to listen on.
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// WebSocket port.
    /// Default: 8765
    #[serde(default = "BindConfig::default_port")]
    pub port: u16,

    /// How many times to retry a failed bind (port held by a lingering process).
    /// Default: 5
    #[serde(default = "BindConfig::default_retries")]
    pub retries: u32,

    /// Delay between bind attempts in milliseconds.
    /// Default: 1000
    #[serde(default = "BindConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8765
    }

    fn default_retries() -> u32 {
        5
    }

    fn default_retry_delay_ms() -> u64 {
        1000
    }

    /// `host:port` suitable for `TcpListener::bind`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            retries: Self::default_retries(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

/// Inbound frame limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Frames larger than this are dropped before parsing.
    /// Default: 262144 (256 KiB)
    #[serde(default = "LimitsConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// How many leading bytes the classifier may inspect for the `type` field.
    /// Default: 60
    #[serde(default = "LimitsConfig::default_classify_prefix_bytes")]
    pub classify_prefix_bytes: usize,
}

impl LimitsConfig {
    fn default_max_frame_bytes() -> usize {
        256 * 1024
    }

    fn default_classify_prefix_bytes() -> usize {
        60
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: Self::default_max_frame_bytes(),
            classify_prefix_bytes: Self::default_classify_prefix_bytes(),
        }
    }
}

/// Ping/pong liveness checking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// How often to ping every connection.
    /// Default: 30000
    #[serde(default = "HeartbeatConfig::default_interval_ms")]
    pub interval_ms: u64,

    /// A connection whose last pong is older than this is closed.
    /// Default: 60000
    #[serde(default = "HeartbeatConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    fn default_interval_ms() -> u64 {
        30_000
    }

    fn default_timeout_ms() -> u64 {
        60_000
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

/// Async dispatch queue for high-frequency messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum queued items before the oldest is dropped.
    /// Default: 1024
    #[serde(default = "QueueConfig::default_capacity")]
    pub capacity: usize,
}

impl QueueConfig {
    fn default_capacity() -> usize {
        1024
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

/// Periodic counters logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Seconds between metrics log lines.
    /// Default: 60
    #[serde(default = "MetricsConfig::default_interval_secs")]
    pub interval_secs: u64,
}

impl MetricsConfig {
    fn default_interval_secs() -> u64 {
        60
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
        }
    }
}

/// Highest accepted `scripting.frame_rate`, in frames per second.
pub const MAX_FRAME_RATE: f64 = 1000.0;

/// Lua pattern host settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptingConfig {
    /// VM instructions a single `calculate` call may execute.
    /// Default: 5000000
    #[serde(default = "ScriptingConfig::default_instruction_budget")]
    pub instruction_budget: u64,

    /// Heap limit for one pattern's Lua state, in bytes.
    /// Default: 33554432 (32 MiB)
    #[serde(default = "ScriptingConfig::default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,

    /// Frames per second of the pattern tick loop.
    /// Default: 30
    #[serde(default = "ScriptingConfig::default_frame_rate")]
    pub frame_rate: f64,

    /// Extra directory scanned for `*.lua` patterns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_dir: Option<PathBuf>,
}

impl ScriptingConfig {
    fn default_instruction_budget() -> u64 {
        5_000_000
    }

    fn default_memory_limit_bytes() -> usize {
        32 * 1024 * 1024
    }

    fn default_frame_rate() -> f64 {
        30.0
    }

    /// Period of the frame loop. Rates outside `(0, MAX_FRAME_RATE]` fall
    /// back to the default or the cap, so the period is never zero.
    pub fn frame_interval(&self) -> Duration {
        let rate = if self.frame_rate.is_finite() && self.frame_rate > 0.0 {
            self.frame_rate.min(MAX_FRAME_RATE)
        } else {
            Self::default_frame_rate()
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            instruction_budget: Self::default_instruction_budget(),
            memory_limit_bytes: Self::default_memory_limit_bytes(),
            frame_rate: Self::default_frame_rate(),
            pattern_dir: None,
        }
    }
}

/// Log level and optional OTLP export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. Unset means plain console logging only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: Self::default_log_level(),
        }
    }
}

/// Everything fixed once the server is running.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub scripting: ScriptingConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
