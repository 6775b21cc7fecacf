//! Energy-based scorer.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming frame.
//! 2. Map it linearly onto a probability: `rms / reference_rms`, capped at 1.0.
//!
//! Hysteresis lives in the gate, so this scorer is stateless.

use super::{rms, FrameScore, SpeechScorer};
use crate::buffering::AudioFrame;
use crate::error::Result;

/// A simple energy-based speech scorer.
#[derive(Debug, Clone)]
pub struct EnergyScorer {
    /// RMS level that maps to probability 1.0.
    /// Typical range: 0.02–0.1 for a close-talking microphone.
    reference_rms: f32,
}

impl EnergyScorer {
    /// Create a new `EnergyScorer`. Non-positive references fall back to the default.
    pub fn new(reference_rms: f32) -> Self {
        let reference_rms = if reference_rms > 0.0 {
            reference_rms
        } else {
            DEFAULT_REFERENCE_RMS
        };
        Self { reference_rms }
    }
}

const DEFAULT_REFERENCE_RMS: f32 = 0.04;

impl Default for EnergyScorer {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_RMS)
    }
}

impl SpeechScorer for EnergyScorer {
    fn score(&mut self, frame: &AudioFrame) -> Result<FrameScore> {
        let energy = rms(&frame.samples);
        Ok(FrameScore {
            probability: (energy / self.reference_rms).min(1.0),
            energy,
        })
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(amplitude: f32, len: usize) -> AudioFrame {
        AudioFrame::new(vec![amplitude; len], 16_000, 0)
    }

    #[test]
    fn silence_scores_zero() {
        let mut scorer = EnergyScorer::default();
        let score = scorer.score(&frame(0.0, 320)).unwrap();
        assert_eq!(score.probability, 0.0);
        assert_eq!(score.energy, 0.0);
    }

    #[test]
    fn loud_frame_saturates() {
        let mut scorer = EnergyScorer::new(0.02);
        let score = scorer.score(&frame(0.5, 320)).unwrap();
        assert_eq!(score.probability, 1.0);
        assert!((score.energy - 0.5).abs() < 1e-5);
    }

    #[test]
    fn probability_is_linear_below_reference() {
        let mut scorer = EnergyScorer::new(0.1);
        let score = scorer.score(&frame(0.05, 320)).unwrap();
        assert!((score.probability - 0.5).abs() < 1e-5, "p={}", score.probability);
    }

    #[test]
    fn rms_of_square_wave() {
        // A square wave at ±0.5 should have RMS = 0.5
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let r = rms(&samples);
        assert!((r - 0.5).abs() < 1e-5, "rms={r}");
    }

    #[test]
    fn non_positive_reference_uses_default() {
        let mut scorer = EnergyScorer::new(0.0);
        let score = scorer.score(&frame(0.02, 320)).unwrap();
        assert!((score.probability - 0.5).abs() < 1e-5);
    }
}
