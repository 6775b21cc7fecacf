//! Engine configuration.
//!
//! Every section derives `serde` with `#[serde(default)]`, so a JSON file only
//! needs the fields it overrides. Call `normalize()` after loading to clamp
//! values into workable ranges.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Voice-activity gate tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct GateConfig {
    /// Smoothed speech probability at or above which a frame counts as a hit.
    pub threshold: f32,
    /// Minimum frame energy (RMS) for a hit. `0.0` disables the energy check.
    pub min_energy: f32,
    /// Consecutive hits needed to confirm utterance-start.
    pub required_hits: u32,
    /// Consecutive misses needed to confirm utterance-end.
    pub required_misses: u32,
    /// Moving-average window over speech probabilities, in frames.
    pub smoothing_window: usize,
    /// Hard cap on utterance length before a forced end (ms of audio).
    pub watchdog_ms: u64,
    /// Frame duration (ms). Frames of any other length are malformed.
    pub frame_ms: u32,
    /// Input sample rate (Hz).
    pub sample_rate: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_energy: 0.0,
            required_hits: 3,
            required_misses: 15, // 300 ms at 20 ms frames
            smoothing_window: 1,
            watchdog_ms: 30_000,
            frame_ms: 20,
            sample_rate: 16_000,
        }
    }
}

impl GateConfig {
    /// Samples per frame implied by `frame_ms` and `sample_rate`.
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1_000
    }
}

/// Segment buffer limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SegmentConfig {
    /// Maximum frames buffered for one utterance.
    pub max_frames: usize,
    /// Frames kept from before utterance-start and prepended to the segment.
    /// `None` uses `gate.required_hits`.
    pub preroll_frames: Option<usize>,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_frames: 1_600, // 32 s at 20 ms, above the default watchdog
            preroll_frames: None,
        }
    }
}

/// Encoding of synthesized audio inside event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// 16-bit PCM WAV container.
    Wav,
    /// Raw little-endian 16-bit PCM, no header.
    Pcm16,
}

/// Output pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct OutputConfig {
    /// A sentence terminator only closes a unit once this many characters
    /// are buffered, so "Hi." does not become its own synthesis call.
    pub min_sentence_chars: usize,
    /// Units are force-split at the last whitespace beyond this length.
    pub max_sentence_chars: usize,
    /// Emit combined audio+expression events instead of raw audio chunks.
    pub emit_expression: bool,
    /// Amplitude envelope rate (values per second).
    pub envelope_fps: u32,
    pub audio_format: AudioFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 8,
            max_sentence_chars: 240,
            emit_expression: true,
            envelope_fps: 60,
            audio_format: AudioFormat::Wav,
        }
    }
}

/// Per-session behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    /// Messages of conversation history handed to the generator.
    pub history_limit: usize,
    /// Interrupt the active turn when the user starts speaking over it.
    pub barge_in: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            barge_in: true,
        }
    }
}

/// Which registered factory to use for each capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ProviderSelection {
    pub transcriber: String,
    pub generator: String,
    pub synthesizer: String,
    pub scorer: String,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self {
            transcriber: "stub".into(),
            generator: "echo".into(),
            synthesizer: "tone".into(),
            scorer: "energy".into(),
        }
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    pub gate: GateConfig,
    pub segment: SegmentConfig,
    pub output: OutputConfig,
    pub session: SessionConfig,
    pub providers: ProviderSelection,
}

impl EngineConfig {
    /// Parse and normalize a JSON document.
    ///
    /// # Errors
    /// `ParleyError::Json` on malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: EngineConfig = serde_json::from_str(json)?;
        config.normalize();
        Ok(config)
    }

    /// Read, parse and normalize a JSON config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Clamp every field into a range the engine can run with.
    pub fn normalize(&mut self) {
        let gate = &mut self.gate;
        gate.threshold = gate.threshold.clamp(0.0, 1.0);
        gate.min_energy = gate.min_energy.clamp(0.0, 1.0);
        gate.required_hits = gate.required_hits.clamp(1, 100);
        gate.required_misses = gate.required_misses.clamp(1, 500);
        gate.smoothing_window = gate.smoothing_window.clamp(1, 50);
        gate.frame_ms = gate.frame_ms.clamp(5, 100);
        gate.sample_rate = gate.sample_rate.clamp(8_000, 48_000);
        gate.watchdog_ms = gate.watchdog_ms.clamp(gate.frame_ms as u64, 600_000);

        // A forced end must always fit: pre-roll, the confirming frame, then
        // every frame up to the watchdog.
        let watchdog_frames = self.gate.watchdog_ms.div_ceil(self.gate.frame_ms as u64) as usize;
        let floor = self.preroll_frames() + 1 + watchdog_frames;
        self.segment.max_frames = self.segment.max_frames.max(floor);

        let output = &mut self.output;
        output.max_sentence_chars = output.max_sentence_chars.clamp(16, 4_000);
        output.min_sentence_chars = output.min_sentence_chars.min(output.max_sentence_chars);
        output.envelope_fps = output.envelope_fps.clamp(1, 240);

        let providers = &mut self.providers;
        for key in [
            &mut providers.transcriber,
            &mut providers.generator,
            &mut providers.synthesizer,
            &mut providers.scorer,
        ] {
            *key = key.trim().to_ascii_lowercase();
        }
    }

    /// Pre-roll length after applying the `required_hits` fallback.
    pub fn preroll_frames(&self) -> usize {
        self.segment
            .preroll_frames
            .unwrap_or(self.gate.required_hits as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{ "gate": { "requiredHits": 5 }, "output": { "audioFormat": "pcm16" } }"#,
        )
        .expect("parse config");
        assert_eq!(cfg.gate.required_hits, 5);
        assert_eq!(cfg.gate.required_misses, 15);
        assert_eq!(cfg.output.audio_format, AudioFormat::Pcm16);
        assert_eq!(cfg.providers.generator, "echo");
        assert_eq!(cfg.preroll_frames(), 5);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut cfg = EngineConfig::default();
        cfg.gate.threshold = 3.0;
        cfg.gate.required_hits = 0;
        cfg.gate.smoothing_window = 0;
        cfg.output.min_sentence_chars = 10_000;
        cfg.providers.synthesizer = "  Tone ".into();
        cfg.normalize();

        assert_eq!(cfg.gate.threshold, 1.0);
        assert_eq!(cfg.gate.required_hits, 1);
        assert_eq!(cfg.gate.smoothing_window, 1);
        assert_eq!(cfg.output.min_sentence_chars, cfg.output.max_sentence_chars);
        assert_eq!(cfg.providers.synthesizer, "tone");
        assert_eq!(cfg.segment.max_frames, 1_600, "default already fits the watchdog");
    }

    #[test]
    fn normalize_grows_segment_to_cover_the_watchdog() {
        let cfg = EngineConfig::from_json_str(
            r#"{ "gate": { "watchdogMs": 60000, "frameMs": 20, "requiredHits": 4 },
                 "segment": { "maxFrames": 100 } }"#,
        )
        .expect("parse config");
        assert_eq!(cfg.segment.max_frames, 4 + 1 + 3_000);
    }

    #[test]
    fn frame_len_matches_rate() {
        assert_eq!(GateConfig::default().frame_len(), 320);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(ParleyError::Json(_))
        ));
    }
}
