//! Bootstrap configuration - seeds the zone directory, then runtime owns it.

use serde::{Deserialize, Serialize};

/// One zone to create at startup.
///
/// Only `id` and `pattern` are required; unset tuning values fall back to
/// the pattern's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneSeed {
    pub id: String,

    pub pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat_boost: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_scale: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_scale: Option<f32>,
}

impl ZoneSeed {
    pub fn new(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            entity_count: None,
            zone_size: None,
            beat_boost: None,
            base_scale: None,
            max_scale: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapConfig {
    #[serde(default = "BootstrapConfig::default_zones")]
    pub zones: Vec<ZoneSeed>,
}

impl BootstrapConfig {
    fn default_zones() -> Vec<ZoneSeed> {
        vec![ZoneSeed::new("main", "spectrum_bars")]
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            zones: Self::default_zones(),
        }
    }
}
