//! Layered configuration loading for Glow.
//!
//! Every Glow binary reads its settings through this crate so that the
//! control-plane server, the pattern host and any tooling agree on defaults.
//!
//! # Two kinds of settings
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change once the
//!   service is up - bind address, frame limits, heartbeat timings, script
//!   budgets, telemetry endpoints.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial zones and their patterns.
//!   After startup, the zone directory owns this state and control commands
//!   change it.
//!
//! # Where settings come from
//!
//! Each layer overrides the one before it:
//! 1. `/etc/glow/config.toml` (system)
//! 2. `~/.config/glow/config.toml` (user)
//! 3. `./glow.toml` (local override, or an explicit path)
//! 4. Environment variables (`GLOW_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! host = "0.0.0.0"
//! port = 8765
//!
//! [heartbeat]
//! interval_ms = 30000
//! timeout_ms = 60000
//!
//! [scripting]
//! instruction_budget = 5000000
//! pattern_dir = "~/.config/glow/patterns"
//!
//! [[bootstrap.zones]]
//! id = "main"
//! pattern = "spectrum_bars"
//! entity_count = 64
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ZoneSeed};
pub use infra::{
    BindConfig, HeartbeatConfig, InfraConfig, LimitsConfig, MetricsConfig, QueueConfig,
    ScriptingConfig, TelemetryConfig, MAX_FRAME_RATE,
};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid merged configuration: {0}")]
    Invalid(String),
}

/// Complete Glow configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GlowConfig {
    /// Fixed for the life of the process.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds the zone directory.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl GlowConfig {
    /// Defaults, then every discovered file, then the environment. An
    /// existing `config_path` takes the place of `./glow.toml`. Also reports
    /// which files and variables applied.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = Self::from_table(merged)?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document on top of compiled defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table =
            contents
                .parse()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: PathBuf::from("<inline>"),
                    message: e.to_string(),
                })?;
        let config = Self::from_table(table)?;
        config.validate()?;
        Ok(config)
    }

    fn from_table(table: toml::Table) -> Result<Self, ConfigError> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let infra = &self.infra;
        if infra.limits.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("limits.max_frame_bytes must be > 0".into()));
        }
        if infra.limits.classify_prefix_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.classify_prefix_bytes must be > 0".into(),
            ));
        }
        if infra.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat.interval_ms must be > 0".into()));
        }
        if infra.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be > 0".into()));
        }
        let rate = infra.scripting.frame_rate;
        if !(rate.is_finite() && rate > 0.0 && rate <= MAX_FRAME_RATE) {
            return Err(ConfigError::Invalid(format!(
                "scripting.frame_rate must be in (0, {MAX_FRAME_RATE}], got {rate}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for zone in &self.bootstrap.zones {
            if !seen.insert(zone.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap zone '{}' declared twice",
                    zone.id
                )));
            }
        }
        Ok(())
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# Glow Configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}
