//! Hysteresis gate over per-frame speech scores.
//!
//! ## States
//!
//! ```text
//!            requiredHits consecutive hits
//!   IDLE ─────────────────────────────────► ACTIVE ◄──┐
//!    ▲                                        │ miss   │ hit
//!    │  requiredMisses consecutive misses     ▼        │
//!    └──────────────────────────────────── TRAILING ───┘
//!
//!   ACTIVE | TRAILING ── watchdog elapsed ──► IDLE (forced end)
//! ```
//!
//! The watchdog counts audio time since utterance-start, not wall time, so
//! the gate is deterministic for a given frame sequence.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::SpeechScorer;
use crate::buffering::AudioFrame;
use crate::config::GateConfig;
use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No speech observed.
    Idle,
    /// Speech confirmed.
    Active,
    /// Candidate end-of-speech, awaiting confirmation.
    Trailing,
}

/// Utterance boundary signalled by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    UtteranceStart,
    /// `forced` is set when the watchdog cut the utterance.
    UtteranceEnd { forced: bool },
}

pub struct VoiceActivityGate {
    config: GateConfig,
    scorer: Box<dyn SpeechScorer>,
    state: GateState,
    hits: u32,
    misses: u32,
    window: VecDeque<f32>,
    /// Audio time since utterance-start.
    utterance_ms: u64,
    frame_len: usize,
    frames_dropped: u64,
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig, scorer: Box<dyn SpeechScorer>) -> Self {
        let frame_len = config.frame_len();
        let window = VecDeque::with_capacity(config.smoothing_window.max(1));
        Self {
            config,
            scorer,
            state: GateState::Idle,
            hits: 0,
            misses: 0,
            window,
            utterance_ms: 0,
            frame_len,
            frames_dropped: 0,
        }
    }

    /// Feed one frame through the gate.
    ///
    /// Returns the boundary this frame confirmed, if any.
    ///
    /// # Errors
    /// `MalformedFrame` when the frame fails validation or the scorer rejects
    /// it. The frame is dropped and the gate state is untouched.
    pub fn process(&mut self, frame: &AudioFrame) -> Result<Option<GateEvent>> {
        if let Err(e) = frame.validate(self.config.sample_rate, self.frame_len) {
            self.frames_dropped += 1;
            warn!(frame = frame.index, error = %e, "dropping malformed frame");
            return Err(e);
        }

        let score = match self.scorer.score(frame) {
            Ok(s) => s,
            Err(e) => {
                self.frames_dropped += 1;
                warn!(frame = frame.index, error = %e, "scorer rejected frame, dropping");
                return Err(ParleyError::MalformedFrame(e.to_string()));
            }
        };

        let probability = self.smooth(score.probability);
        let hit = probability >= self.config.threshold && score.energy >= self.config.min_energy;

        Ok(self.advance(hit))
    }

    fn smooth(&mut self, probability: f32) -> f32 {
        let cap = self.config.smoothing_window.max(1);
        if self.window.len() == cap {
            self.window.pop_front();
        }
        self.window.push_back(probability);
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    fn advance(&mut self, hit: bool) -> Option<GateEvent> {
        match self.state {
            GateState::Idle => {
                if !hit {
                    self.hits = 0;
                    return None;
                }
                self.hits += 1;
                if self.hits < self.config.required_hits {
                    return None;
                }
                self.state = GateState::Active;
                self.hits = 0;
                self.misses = 0;
                self.utterance_ms = 0;
                debug!("utterance start");
                return Some(GateEvent::UtteranceStart);
            }
            GateState::Active | GateState::Trailing => {
                self.utterance_ms += self.config.frame_ms as u64;
                if hit {
                    self.misses = 0;
                    self.state = GateState::Active;
                } else {
                    self.misses += 1;
                    self.state = GateState::Trailing;
                    if self.misses >= self.config.required_misses {
                        debug!(utterance_ms = self.utterance_ms, "utterance end");
                        self.finish();
                        return Some(GateEvent::UtteranceEnd { forced: false });
                    }
                }
            }
        }

        if self.utterance_ms >= self.config.watchdog_ms {
            warn!(
                utterance_ms = self.utterance_ms,
                watchdog_ms = self.config.watchdog_ms,
                "watchdog forcing utterance end"
            );
            self.finish();
            return Some(GateEvent::UtteranceEnd { forced: true });
        }
        None
    }

    /// Back to `Idle`. The smoothing window is cleared so the next start is
    /// judged on its own frames only.
    fn finish(&mut self) {
        self.state = GateState::Idle;
        self.hits = 0;
        self.misses = 0;
        self.utterance_ms = 0;
        self.window.clear();
    }

    /// Return to `Idle` without emitting an end, clearing scorer state too.
    pub fn reset(&mut self) {
        self.finish();
        self.scorer.reset();
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}
