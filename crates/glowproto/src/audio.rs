//! Per-tick audio feature snapshot.

use serde::{Deserialize, Serialize};

/// Number of frequency bands, bass first.
pub const BAND_COUNT: usize = 5;

/// One frame of audio features from the upstream analyser.
///
/// Values arrive from an external producer and are not trusted to be in
/// range; call [`AudioState::clamped`] before handing them to a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioState {
    /// Band energies, bass → high.
    #[serde(default)]
    pub bands: [f32; BAND_COUNT],

    #[serde(default)]
    pub amplitude: f32,

    #[serde(default)]
    pub is_beat: bool,

    #[serde(default)]
    pub beat_intensity: f32,

    #[serde(default)]
    pub frame: u64,
}

impl AudioState {
    /// All-zero input at the given frame.
    pub fn silent(frame: u64) -> Self {
        Self {
            bands: [0.0; BAND_COUNT],
            amplitude: 0.0,
            is_beat: false,
            beat_intensity: 0.0,
            frame,
        }
    }

    /// Copy with every normalized field forced into [0, 1]. NaN becomes 0.
    pub fn clamped(&self) -> Self {
        let mut bands = self.bands;
        for band in bands.iter_mut() {
            *band = unit(*band);
        }
        Self {
            bands,
            amplitude: unit(self.amplitude),
            is_beat: self.is_beat,
            beat_intensity: unit(self.beat_intensity),
            frame: self.frame,
        }
    }
}

impl Default for AudioState {
    fn default() -> Self {
        Self::silent(0)
    }
}

pub(crate) fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_limits_every_field() {
        let raw = AudioState {
            bands: [1.5, -0.2, 0.5, f32::NAN, f32::INFINITY],
            amplitude: 3.0,
            is_beat: true,
            beat_intensity: -1.0,
            frame: 7,
        };
        let clamped = raw.clamped();
        assert_eq!(clamped.bands, [1.0, 0.0, 0.5, 0.0, 1.0]);
        assert_eq!(clamped.amplitude, 1.0);
        assert_eq!(clamped.beat_intensity, 0.0);
        assert!(clamped.is_beat);
        assert_eq!(clamped.frame, 7);
    }

    #[test]
    fn missing_fields_default_to_silence() {
        let state: AudioState = serde_json::from_str(r#"{"amplitude": 0.4}"#).unwrap();
        assert_eq!(state.bands, [0.0; BAND_COUNT]);
        assert_eq!(state.amplitude, 0.4);
        assert!(!state.is_beat);
    }
}
