//! Fixed-duration input frames fed to the voice-activity gate.

use crate::error::{ParleyError, Result};

/// One fixed-duration slice of mono PCM captured from the user.
///
/// Ownership moves from the producer into the gate/collector; accepted
/// frames end up inside a `Segment`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Producer-assigned frame index, used for gap detection in logs.
    pub index: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, index: u64) -> Self {
        Self {
            samples,
            sample_rate,
            index,
        }
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1_000) / self.sample_rate as u64
    }

    /// Check the frame against the stream format the gate was configured for.
    ///
    /// # Errors
    /// `ParleyError::MalformedFrame` when the frame is empty, has the wrong
    /// sample rate or length, or contains non-finite samples.
    pub fn validate(&self, sample_rate: u32, frame_len: usize) -> Result<()> {
        if self.samples.is_empty() {
            return Err(ParleyError::MalformedFrame(format!(
                "frame {} is empty",
                self.index
            )));
        }
        if self.sample_rate != sample_rate {
            return Err(ParleyError::MalformedFrame(format!(
                "frame {} has sample rate {} (expected {})",
                self.index, self.sample_rate, sample_rate
            )));
        }
        if self.samples.len() != frame_len {
            return Err(ParleyError::MalformedFrame(format!(
                "frame {} has {} samples (expected {})",
                self.index,
                self.samples.len(),
                frame_len
            )));
        }
        if self.samples.iter().any(|s| !s.is_finite()) {
            return Err(ParleyError::MalformedFrame(format!(
                "frame {} contains non-finite samples",
                self.index
            )));
        }
        Ok(())
    }
}
