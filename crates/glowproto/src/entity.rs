//! Pattern tuning and the entity records patterns produce.

use serde::{Deserialize, Serialize};

use crate::audio::{unit, BAND_COUNT};

/// Per-zone tuning handed to a pattern every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Target number of entities.
    pub entity_count: u32,
    /// Nominal zone edge length in world units.
    pub zone_size: u32,
    /// Scale multiplier applied on beats.
    pub beat_boost: f32,
    pub base_scale: f32,
    pub max_scale: f32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            entity_count: 64,
            zone_size: 32,
            beat_boost: 1.5,
            base_scale: 0.2,
            max_scale: 1.0,
        }
    }
}

impl PatternConfig {
    /// Keep the numbers a pattern sees sane regardless of what a client sent.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let finite_or = |v: f32, d: f32| if v.is_finite() { v } else { d };
        let max_scale = finite_or(self.max_scale, defaults.max_scale).max(0.0);
        Self {
            entity_count: self.entity_count.min(MAX_ENTITY_COUNT),
            zone_size: self.zone_size.max(1),
            beat_boost: finite_or(self.beat_boost, defaults.beat_boost).max(0.0),
            base_scale: finite_or(self.base_scale, defaults.base_scale).clamp(0.0, max_scale),
            max_scale,
        }
    }
}

/// Upper bound on entities per zone.
pub const MAX_ENTITY_COUNT: u32 = 4096;

/// Partial update from a `set_zone_config` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfigPatch {
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

impl ZoneConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply set fields over `config` and return the sanitized result.
    pub fn apply(&self, config: &PatternConfig) -> PatternConfig {
        PatternConfig {
            entity_count: self.entity_count.unwrap_or(config.entity_count),
            zone_size: self.zone_size.unwrap_or(config.zone_size),
            beat_boost: self.beat_boost.unwrap_or(config.beat_boost),
            base_scale: self.base_scale.unwrap_or(config.base_scale),
            max_scale: self.max_scale.unwrap_or(config.max_scale),
        }
        .sanitized()
    }
}

/// One renderable point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    /// Stable across frames for the same logical point.
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub scale: f32,
    /// 0-based band index, used downstream for colour/material.
    pub band: u8,
    /// Degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default = "visible_default")]
    pub visible: bool,
}

fn visible_default() -> bool {
    true
}

impl EntityData {
    /// Force the record into the renderer's contract: coordinates in [0, 1],
    /// scale in [0, max_scale], band within the band range, finite rotation.
    pub fn clamp_to(mut self, config: &PatternConfig) -> Self {
        self.x = unit_or_mid(self.x);
        self.y = unit_or_mid(self.y);
        self.z = unit_or_mid(self.z);
        self.scale = if self.scale.is_finite() {
            self.scale.clamp(0.0, config.max_scale.max(0.0))
        } else {
            config.base_scale.clamp(0.0, config.max_scale.max(0.0))
        };
        self.band = self.band.min((BAND_COUNT - 1) as u8);
        self.rotation = self.rotation.filter(|r| r.is_finite()).map(|r| r.rem_euclid(360.0));
        self
    }
}

fn unit_or_mid(value: f32) -> f32 {
    if value.is_nan() {
        0.5
    } else {
        unit(value)
    }
}
