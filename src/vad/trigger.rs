//! Capture triggers: wake phrase, energy spike, button

use serde::{Deserialize, Serialize};

/// What started a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    WakeWord,
    Energy,
    Button,
}

/// Scores audio frames for a wake phrase
///
/// Implementations run on the device and must be cheap enough to call
/// once per captured frame.
pub trait WakeWordModel: Send {
    /// Phrase this model listens for
    fn phrase(&self) -> &str;

    /// Confidence in `[0, 1]` that the phrase ends in this frame
    fn score(&mut self, samples: &[i16]) -> f32;

    /// Forget any accumulated state
    fn reset(&mut self) {}
}

/// Normalize a wake phrase for comparison and logging
#[must_use]
pub fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// RMS energy of 16-bit samples, scaled to `[0, 1]`
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32_768.0;
            v * v
        })
        .sum();

    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}
