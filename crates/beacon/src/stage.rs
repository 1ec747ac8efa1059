//! Zone directory.
//!
//! A zone is a named region of the render target with its own pattern,
//! tuning, render mode and latest audio snapshot. Control commands edit zones
//! here; the frame loop reads them through [`Stage::plan_frames`]. State is
//! in memory only.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use glowconf::ZoneSeed;
use glowproto::{
    AudioState, EntityData, Message, PatternConfig, RenderMode, ZoneConfigPatch,
};
use patternette::PatternHost;
use tracing::{debug, info};

use crate::dispatch::MessageHandler;
use crate::error::StageError;

const DEFAULT_EFFECT_DURATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    /// Forces a beat, then fades the beat intensity.
    Beat,
    /// Lifts amplitude and every band, then fades.
    Flash,
}

impl EffectKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "beat" => Some(EffectKind::Beat),
            "flash" => Some(EffectKind::Flash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveEffect {
    kind: EffectKind,
    intensity: f32,
    started: Instant,
    duration: Duration,
    fired: bool,
}

impl ActiveEffect {
    /// Linear fade from `intensity` to zero over `duration`.
    fn level_at(&self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration {
            return None;
        }
        let remaining = 1.0 - elapsed.as_secs_f32() / self.duration.as_secs_f32();
        Some(self.intensity * remaining)
    }

    fn apply(&mut self, audio: &mut AudioState, level: f32) {
        match self.kind {
            EffectKind::Beat => {
                if !self.fired {
                    audio.is_beat = true;
                    self.fired = true;
                }
                audio.beat_intensity = audio.beat_intensity.max(level);
            }
            EffectKind::Flash => {
                audio.amplitude = audio.amplitude.max(level);
                for band in audio.bands.iter_mut() {
                    *band = band.max(level);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Zone {
    pub pattern: Option<String>,
    pub config: PatternConfig,
    pub render_mode: RenderMode,
    pub audio: AudioState,
    /// Frames published so far.
    pub frame: u64,
    effect: Option<ActiveEffect>,
    pending_batch: Option<Vec<EntityData>>,
}

impl Zone {
    fn new() -> Self {
        Self {
            pattern: None,
            config: PatternConfig::default(),
            render_mode: RenderMode::default(),
            audio: AudioState::default(),
            frame: 0,
            effect: None,
            pending_batch: None,
        }
    }

    pub fn effect(&self) -> Option<EffectKind> {
        self.effect.as_ref().map(|e| e.kind)
    }
}

/// Where a zone's next frame comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSource {
    /// Run the zone's pattern.
    Pattern,
    /// Publish entities pushed by a `batch_update`.
    External(Vec<EntityData>),
}

/// Everything needed to produce one zone's next frame outside the lock.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub zone: String,
    pub frame: u64,
    pub audio: AudioState,
    pub config: PatternConfig,
    pub source: FrameSource,
}

pub struct Stage {
    host: Arc<PatternHost>,
    zones: RwLock<BTreeMap<String, Zone>>,
}

impl Stage {
    pub fn new(host: Arc<PatternHost>) -> Self {
        Self {
            host,
            zones: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<PatternHost> {
        &self.host
    }

    /// Create the startup zones.
    pub fn seed(&self, seeds: &[ZoneSeed]) -> Result<(), StageError> {
        for seed in seeds {
            self.set_pattern(&seed.id, &seed.pattern)?;
            let patch = ZoneConfigPatch {
                entity_count: seed.entity_count,
                zone_size: seed.zone_size,
                beat_boost: seed.beat_boost,
                base_scale: seed.base_scale,
                max_scale: seed.max_scale,
            };
            if !patch.is_empty() {
                self.set_zone_config(&seed.id, &patch)?;
            }
        }
        info!(zones = seeds.len(), "Zones seeded");
        Ok(())
    }

    /// Bind a pattern, creating the zone if needed. An unknown pattern
    /// leaves the zone as it was.
    pub fn set_pattern(&self, zone: &str, pattern: &str) -> Result<(), StageError> {
        // held across activation so the zone record names what the host runs
        let mut zones = self.write();
        self.host.activate(zone, pattern)?;
        zones
            .entry(zone.to_string())
            .or_insert_with(Zone::new)
            .pattern = Some(pattern.to_string());
        Ok(())
    }

    pub fn set_zone_config(
        &self,
        zone: &str,
        patch: &ZoneConfigPatch,
    ) -> Result<PatternConfig, StageError> {
        self.with_zone(zone, |z| {
            z.config = patch.apply(&z.config);
            z.config
        })
    }

    pub fn set_render_mode(&self, zone: &str, mode: RenderMode) -> Result<(), StageError> {
        self.with_zone(zone, |z| z.render_mode = mode)
    }

    pub fn trigger_effect(
        &self,
        zone: &str,
        effect: &str,
        intensity: Option<f32>,
        duration_ms: Option<u64>,
    ) -> Result<(), StageError> {
        let kind =
            EffectKind::parse(effect).ok_or_else(|| StageError::UnknownEffect(effect.to_string()))?;
        let intensity = intensity
            .filter(|i| i.is_finite())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        let duration = duration_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_EFFECT_DURATION);
        self.with_zone(zone, |z| {
            z.effect = Some(ActiveEffect {
                kind,
                intensity,
                started: Instant::now(),
                duration,
                fired: false,
            });
        })
    }

    /// Store the latest audio for one zone, or for every zone when `zone`
    /// is `None`.
    pub fn apply_audio(&self, zone: Option<&str>, state: AudioState) -> Result<(), StageError> {
        let state = state.clamped();
        match zone {
            Some(zone) => self.with_zone(zone, |z| z.audio = state),
            None => {
                for z in self.write().values_mut() {
                    z.audio = state;
                }
                Ok(())
            }
        }
    }

    /// Queue externally computed entities for the zone's next frame. A newer
    /// batch replaces one not yet published.
    pub fn store_batch(&self, zone: &str, entities: Vec<EntityData>) -> Result<usize, StageError> {
        self.with_zone(zone, |z| {
            let config = z.config;
            let batch: Vec<EntityData> = entities
                .into_iter()
                .take(config.entity_count as usize)
                .map(|e| e.clamp_to(&config))
                .collect();
            let count = batch.len();
            z.pending_batch = Some(batch);
            count
        })
    }

    pub fn zone(&self, zone: &str) -> Option<Zone> {
        self.read().get(zone).cloned()
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn plan_frames(&self) -> Vec<FramePlan> {
        self.plan_frames_at(Instant::now())
    }

    /// Advance every zone that has something to show and describe its next
    /// frame. Expired effects are cleared.
    pub fn plan_frames_at(&self, now: Instant) -> Vec<FramePlan> {
        let mut zones = self.write();
        let mut plans = Vec::with_capacity(zones.len());

        for (id, z) in zones.iter_mut() {
            let source = match z.pending_batch.take() {
                Some(batch) => FrameSource::External(batch),
                None if z.pattern.is_some() => FrameSource::Pattern,
                None => continue,
            };

            let mut audio = z.audio;
            let level = z.effect.as_ref().and_then(|e| e.level_at(now));
            match level {
                Some(level) => {
                    if let Some(effect) = z.effect.as_mut() {
                        effect.apply(&mut audio, level);
                    }
                }
                None => z.effect = None,
            }

            z.frame += 1;
            plans.push(FramePlan {
                zone: id.clone(),
                frame: z.frame,
                audio,
                config: z.config,
                source,
            });
        }
        plans
    }

    fn with_zone<T>(&self, zone: &str, f: impl FnOnce(&mut Zone) -> T) -> Result<T, StageError> {
        let mut zones = self.write();
        let z = zones
            .get_mut(zone)
            .ok_or_else(|| StageError::UnknownZone(zone.to_string()))?;
        Ok(f(z))
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Zone>> {
        self.zones.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Zone>> {
        self.zones.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageHandler for Stage {
    fn handle(&self, msg: Message) -> Option<Message> {
        let kind = msg.kind();
        let result = match msg {
            Message::SetPattern { zone, pattern } => {
                self.set_pattern(&zone, &pattern).map(|_| zone)
            }
            Message::SetZoneConfig { zone, config } => {
                self.set_zone_config(&zone, &config).map(|_| zone)
            }
            Message::SetRenderMode { zone, mode } => {
                self.set_render_mode(&zone, mode).map(|_| zone)
            }
            Message::TriggerEffect {
                zone,
                effect,
                intensity,
                duration_ms,
            } => self
                .trigger_effect(&zone, &effect, intensity, duration_ms)
                .map(|_| zone),
            Message::GetPatterns => {
                return Some(Message::Patterns {
                    patterns: self.host.catalog().summaries(),
                })
            }
            // telemetry is fire-and-forget; only failures are answered
            Message::BatchUpdate { zone, entities } => {
                return self
                    .store_batch(&zone, entities)
                    .err()
                    .map(|e| Message::error(e.to_string()))
            }
            Message::AudioState { zone, state } => {
                return self
                    .apply_audio(zone.as_deref(), state)
                    .err()
                    .map(|e| Message::error(e.to_string()))
            }
            other => {
                return Some(Message::error(format!(
                    "'{}' is not a zone command",
                    other.kind()
                )))
            }
        };

        Some(match result {
            Ok(zone) => Message::ack(kind, Some(&zone)),
            Err(e) => {
                debug!(request = %kind, error = %e, "Zone command refused");
                Message::error(e.to_string())
            }
        })
    }
}
