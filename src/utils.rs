//! Shared timestamp and audio-sampling helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Smoothing applied to audio level samples
pub const DEFAULT_AUDIO_SMOOTHING: f64 = 0.3;

/// Milliseconds since the Unix epoch (UTC)
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exponentially smoothed audio level of one remote stream.
///
/// `level = smoothing * level + (1 - smoothing) * sample`
#[derive(Debug, Clone)]
pub struct AudioLevel {
    level: f64,
    smoothing: f64,
}

impl AudioLevel {
    pub fn new(smoothing: f64) -> Self {
        Self {
            level: 0.0,
            smoothing: smoothing.clamp(0.0, 1.0),
        }
    }

    /// Fold a sample in. Non-finite or negative samples are ignored.
    pub fn push(&mut self, sample: f64) {
        if !sample.is_finite() || sample < 0.0 {
            return;
        }
        self.level = self.smoothing * self.level + (1.0 - self.smoothing) * sample;
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

impl Default for AudioLevel {
    fn default() -> Self {
        AudioLevel::new(DEFAULT_AUDIO_SMOOTHING)
    }
}
