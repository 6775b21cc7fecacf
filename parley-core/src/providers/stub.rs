//! Deterministic in-crate providers.
//!
//! Used by default and in tests so the whole turn loop can run without any
//! vendor backend:
//! - `StubTranscriber` describes the segment instead of recognising speech
//! - `EchoGenerator` streams a marked-up echo of the user's text word by word
//! - `ScriptedGenerator` replays a fixed list of fragments, optionally paced
//! - `ToneSynthesizer` renders one short tone burst per word

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tracing::debug;

use super::{AudioStream, ChatMessage, Fragment, FragmentStream, Generator, Synthesizer, Transcriber};
use crate::buffering::{AudioChunk, Segment};
use crate::error::Result;

/// Segments shorter than this (10 ms at 16 kHz) transcribe to nothing.
const MIN_SAMPLES: usize = 160;

/// Placeholder transcriber.
///
/// Returns `"[stub: <N> samples @ <SR> Hz]"` for every segment of non-trivial
/// length, and an empty transcription otherwise.
#[derive(Default)]
pub struct StubTranscriber {
    utterance_count: AtomicU32,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn utterance_count(&self) -> u32 {
        self.utterance_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, segment: &Segment) -> Result<String> {
        let samples = segment.samples();
        if samples.len() < MIN_SAMPLES {
            debug!(utterance = segment.utterance_id, "segment too short, empty transcript");
            return Ok(String::new());
        }
        self.utterance_count.fetch_add(1, Ordering::Relaxed);
        Ok(format!(
            "[stub: {} samples @ {} Hz]",
            samples.len(),
            segment.sample_rate
        ))
    }
}

/// Replies with `"[happy]You said: <text>"`, one word per fragment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoGenerator;

impl EchoGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, text: &str, history: &[ChatMessage]) -> Result<FragmentStream> {
        debug!(history = history.len(), "echo generate");
        let reply = format!("[happy]You said: {}", text.trim());
        let mut deltas: Vec<Result<Fragment>> = Vec::new();
        for (i, word) in reply.split_whitespace().enumerate() {
            let delta = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            deltas.push(Ok(Fragment::Text(delta)));
        }
        Ok(Box::pin(stream::iter(deltas)))
    }
}

/// Replays a fixed fragment list for every call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    fragments: Vec<Fragment>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self {
            fragments,
            delay: Duration::ZERO,
        }
    }

    /// Convenience for text-only scripts.
    pub fn from_text<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(deltas.into_iter().map(|d| Fragment::Text(d.into())).collect())
    }

    /// Sleep before yielding each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _text: &str, _history: &[ChatMessage]) -> Result<FragmentStream> {
        let delay = self.delay;
        let fragments = stream::unfold(self.fragments.clone().into_iter(), move |mut rest| async move {
            let next = rest.next()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(next), rest))
        });
        Ok(Box::pin(fragments))
    }
}

/// Renders each word as a short sine burst followed by a gap.
///
/// Burst length scales with word length, so longer replies produce longer
/// audio. One chunk per word.
#[derive(Debug, Clone, Copy)]
pub struct ToneSynthesizer {
    sample_rate: u32,
    ms_per_char: u32,
    gap_ms: u32,
    frequency: f32,
    amplitude: f32,
}

impl ToneSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ms_per_char: 40,
            gap_ms: 60,
            frequency: 220.0,
            amplitude: 0.3,
        }
    }

    fn render_word(&self, word: &str) -> AudioChunk {
        let rate = self.sample_rate as usize;
        let tone_len = rate * (word.chars().count() as u32 * self.ms_per_char) as usize / 1_000;
        let gap_len = rate * self.gap_ms as usize / 1_000;
        let mut samples = Vec::with_capacity(tone_len + gap_len);
        for n in 0..tone_len {
            // Linear fade in/out over the burst to avoid clicks.
            let pos = n as f32 / tone_len.max(1) as f32;
            let fade = (pos.min(1.0 - pos) * 10.0).min(1.0);
            let phase = TAU * self.frequency * n as f32 / self.sample_rate as f32;
            samples.push(self.amplitude * fade * phase.sin());
        }
        samples.resize(tone_len + gap_len, 0.0);
        AudioChunk::new(samples, self.sample_rate)
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let chunks: Vec<Result<AudioChunk>> = text
            .split_whitespace()
            .map(|word| Ok(self.render_word(word)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}
