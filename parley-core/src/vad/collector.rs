//! Gate + segment buffer: turns a frame stream into complete utterances.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::{GateEvent, GateState, VoiceActivityGate};
use crate::buffering::{AudioFrame, Segment, SegmentBuffer};
use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    /// Speech confirmed; the segment buffer is now open.
    Started { utterance_id: u64 },
    /// Utterance ended (normally or by watchdog) and was flushed.
    Completed(Segment),
}

/// Feeds frames through the gate and buffers the frames of each utterance.
///
/// While idle, the last `preroll` frames are kept so the frames that
/// confirmed speech are not lost when the buffer opens.
pub struct UtteranceCollector {
    gate: VoiceActivityGate,
    buffer: SegmentBuffer,
    preroll: VecDeque<AudioFrame>,
    preroll_len: usize,
}

impl UtteranceCollector {
    pub fn new(gate: VoiceActivityGate, buffer: SegmentBuffer, preroll_len: usize) -> Self {
        Self {
            gate,
            buffer,
            preroll: VecDeque::with_capacity(preroll_len),
            preroll_len,
        }
    }

    /// Push one frame.
    ///
    /// # Errors
    /// `MalformedFrame` if the gate dropped the frame.
    pub fn push(&mut self, frame: AudioFrame) -> Result<Option<CollectorEvent>> {
        let event = self.gate.process(&frame)?;

        match event {
            Some(GateEvent::UtteranceStart) => {
                let utterance_id = self.buffer.open();
                let preroll: Vec<AudioFrame> = self.preroll.drain(..).collect();
                for f in preroll {
                    self.append(f);
                }
                self.append(frame);
                debug!(utterance = utterance_id, frames = self.buffer.len(), "collecting utterance");
                Ok(Some(CollectorEvent::Started { utterance_id }))
            }
            Some(GateEvent::UtteranceEnd { forced }) => {
                if self.buffer.is_open() {
                    self.append(frame);
                }
                match self.buffer.flush() {
                    Ok(mut segment) => {
                        segment.forced = forced;
                        debug!(
                            utterance = segment.utterance_id,
                            frames = segment.frames.len(),
                            forced,
                            "utterance complete"
                        );
                        Ok(Some(CollectorEvent::Completed(segment)))
                    }
                    // Discarded mid-utterance; the end has nothing to flush.
                    Err(ParleyError::NoOpenUtterance) => Ok(None),
                    Err(e) => {
                        warn!(error = %e, "utterance flush failed");
                        Ok(None)
                    }
                }
            }
            None => {
                if self.buffer.is_open() {
                    self.append(frame);
                } else if self.gate.state() == GateState::Idle && self.preroll_len > 0 {
                    if self.preroll.len() == self.preroll_len {
                        self.preroll.pop_front();
                    }
                    self.preroll.push_back(frame);
                }
                Ok(None)
            }
        }
    }

    fn append(&mut self, frame: AudioFrame) {
        let index = frame.index;
        if let Err(e) = self.buffer.append(frame) {
            warn!(frame = index, error = %e, "segment buffer rejected frame");
        }
    }

    /// Drop any open utterance. Subsequent frames of that utterance are
    /// ignored until the gate confirms a new start. Returns frames dropped.
    pub fn discard(&mut self) -> usize {
        self.preroll.clear();
        self.buffer.discard()
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    pub fn is_collecting(&self) -> bool {
        self.buffer.is_open()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.gate.frames_dropped()
    }
}
