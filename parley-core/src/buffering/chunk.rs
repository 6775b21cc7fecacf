//! Synthesized audio chunks produced by a `Synthesizer`.

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Unlike `AudioFrame`, chunks have no fixed duration: synthesis backends
/// stream whatever block size they produce.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 22050, 24000).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Join chunks into one contiguous block.
    ///
    /// The sample rate of the first chunk wins; synthesis backends emit a
    /// single rate per utterance. Returns `None` for an empty slice.
    pub fn concat(chunks: &[AudioChunk]) -> Option<AudioChunk> {
        let first = chunks.first()?;
        let total: usize = chunks.iter().map(|c| c.samples.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in chunks {
            samples.extend_from_slice(&chunk.samples);
        }
        Some(AudioChunk::new(samples, first.sample_rate))
    }
}
