//! Voice activity gating.
//!
//! The `SpeechScorer` trait is the extensibility point: swap in `EnergyScorer`
//! (default) or any neural scorer without touching the gate. The gate turns
//! per-frame scores into utterance boundaries; the collector pairs it with a
//! `SegmentBuffer` to produce complete utterances.

pub mod collector;
pub mod energy;
pub mod gate;

pub use collector::{CollectorEvent, UtteranceCollector};
pub use energy::EnergyScorer;
pub use gate::{GateEvent, GateState, VoiceActivityGate};

use crate::buffering::AudioFrame;
use crate::error::Result;

/// Per-frame speech evidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScore {
    /// Speech probability in [0.0, 1.0].
    pub probability: f32,
    /// Root-mean-square energy of the frame.
    pub energy: f32,
}

/// Trait for all per-frame speech scorers.
///
/// Implementors may be stateful (noise-floor trackers, RNN hidden states, etc.).
pub trait SpeechScorer: Send + 'static {
    /// Score one frame. The gate has already validated its shape.
    ///
    /// # Errors
    /// Any error causes the gate to drop the frame without a transition.
    fn score(&mut self, frame: &AudioFrame) -> Result<FrameScore>;

    /// Reset any internal state.
    fn reset(&mut self);
}

/// Root-mean-square of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
