//! Fixed-rate amplitude envelope for mouth animation.
//!
//! The output rate (`fps`) is independent of the audio's native rate: each
//! output slot aggregates the RMS of the native samples that fall into it,
//! and the sequence is peak-normalized to [0.0, 1.0].

use crate::buffering::AudioChunk;
use crate::vad::rms;

#[derive(Debug, Clone, Copy)]
pub struct AudioEnvelopeSampler {
    fps: u32,
}

impl AudioEnvelopeSampler {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Envelope of a synthesized chunk.
    pub fn sample_chunk(&self, chunk: &AudioChunk) -> Vec<f32> {
        self.sample(&chunk.samples, chunk.sample_rate)
    }

    /// One normalized amplitude per `1 / fps` seconds of audio.
    ///
    /// A trailing partial window still gets its own slot, so the envelope
    /// length is `ceil(duration * fps)`.
    pub fn sample(&self, samples: &[f32], sample_rate: u32) -> Vec<f32> {
        if samples.is_empty() || sample_rate == 0 {
            return Vec::new();
        }
        let len = samples.len() as u64;
        let rate = sample_rate as u64;
        let fps = self.fps as u64;
        let slots = (len * fps).div_ceil(rate);

        let mut envelope: Vec<f32> = (0..slots)
            .map(|i| {
                let start = ((i * rate) / fps).min(len) as usize;
                let end = (((i + 1) * rate) / fps).min(len) as usize;
                if end > start {
                    rms(&samples[start..end])
                } else {
                    0.0
                }
            })
            .collect();

        let peak = envelope.iter().copied().fold(0.0_f32, f32::max);
        if peak > 0.0 {
            for value in &mut envelope {
                *value /= peak;
            }
        }
        envelope
    }
}

impl Default for AudioEnvelopeSampler {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn one_value_per_output_frame() {
        let sampler = AudioEnvelopeSampler::new(60);
        let envelope = sampler.sample(&vec![0.1; 16_000], 16_000);
        assert_eq!(envelope.len(), 60);
        for v in envelope {
            assert_relative_eq!(v, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn partial_tail_gets_a_slot() {
        let sampler = AudioEnvelopeSampler::new(10);
        // 0.25 s at 8 kHz → 2.5 slots → 3.
        assert_eq!(sampler.sample(&vec![0.2; 2_000], 8_000).len(), 3);
    }

    #[test]
    fn tracks_loudness_and_normalizes_to_peak() {
        let sampler = AudioEnvelopeSampler::new(4);
        let mut samples = vec![0.0; 4_000];
        samples.extend(vec![0.5; 4_000]);
        samples.extend(vec![0.25; 8_000]);
        let envelope = sampler.sample(&samples, 16_000);
        assert_eq!(envelope.len(), 4);
        assert_relative_eq!(envelope[0], 0.0);
        assert_relative_eq!(envelope[1], 1.0, epsilon = 1e-5);
        assert_relative_eq!(envelope[2], 0.5, epsilon = 1e-5);
        assert_relative_eq!(envelope[3], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn silence_stays_zero_and_empty_is_empty() {
        let sampler = AudioEnvelopeSampler::default();
        assert!(sampler.sample(&vec![0.0; 800], 16_000).iter().all(|v| *v == 0.0));
        assert!(sampler.sample(&[], 16_000).is_empty());
        assert!(sampler.sample(&[0.1], 0).is_empty());
    }
}
