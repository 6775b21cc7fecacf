//! Per-session accumulation of one utterance's frames.
//!
//! ```text
//! open() ──► append()* ──► flush()   → Segment (buffer closed)
//!                     └──► discard() → dropped (buffer closed)
//! ```
//!
//! A flush closes the buffer, so a second flush for the same utterance fails
//! with `NoOpenUtterance` until the next `open()`.

use tracing::debug;

use super::frame::AudioFrame;
use crate::error::{ParleyError, Result};

/// The accumulated frames of one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Per-buffer utterance counter, starting at 1.
    pub utterance_id: u64,
    pub frames: Vec<AudioFrame>,
    pub sample_rate: u32,
    /// `true` when the utterance was cut by the gate watchdog.
    pub forced: bool,
}

impl Segment {
    /// All samples of the utterance, in frame order.
    pub fn samples(&self) -> Vec<f32> {
        let total: usize = self.frames.iter().map(|f| f.samples.len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        let total: usize = self.frames.iter().map(|f| f.samples.len()).sum();
        total as f64 / self.sample_rate as f64
    }
}

/// Bounded buffer of frames between utterance-start and utterance-end.
#[derive(Debug)]
pub struct SegmentBuffer {
    frames: Vec<AudioFrame>,
    max_frames: usize,
    open: bool,
    sample_rate: u32,
    next_utterance_id: u64,
    current_utterance_id: u64,
}

impl SegmentBuffer {
    pub fn new(max_frames: usize, sample_rate: u32) -> Self {
        Self {
            frames: Vec::new(),
            max_frames: max_frames.max(1),
            open: false,
            sample_rate,
            next_utterance_id: 1,
            current_utterance_id: 0,
        }
    }

    /// Start a new utterance. Any frames of an unflushed previous utterance
    /// are dropped.
    pub fn open(&mut self) -> u64 {
        if self.open && !self.frames.is_empty() {
            debug!(
                utterance = self.current_utterance_id,
                frames = self.frames.len(),
                "reopening segment buffer, dropping unflushed frames"
            );
        }
        self.frames.clear();
        self.open = true;
        self.current_utterance_id = self.next_utterance_id;
        self.next_utterance_id += 1;
        self.current_utterance_id
    }

    /// Append a frame to the open utterance.
    ///
    /// # Errors
    /// - `NoOpenUtterance` if `open()` has not been called since the last flush.
    /// - `SegmentFull` once `max_frames` frames are buffered; the frame is dropped.
    pub fn append(&mut self, frame: AudioFrame) -> Result<()> {
        if !self.open {
            return Err(ParleyError::NoOpenUtterance);
        }
        if self.frames.len() >= self.max_frames {
            return Err(ParleyError::SegmentFull {
                max_frames: self.max_frames,
            });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Take the accumulated segment and close the buffer.
    ///
    /// # Errors
    /// - `NoOpenUtterance` if no utterance is open (including a second flush).
    /// - `EmptySegment` if the utterance has no frames; the buffer is closed anyway.
    pub fn flush(&mut self) -> Result<Segment> {
        if !self.open {
            return Err(ParleyError::NoOpenUtterance);
        }
        self.open = false;
        if self.frames.is_empty() {
            return Err(ParleyError::EmptySegment);
        }
        Ok(Segment {
            utterance_id: self.current_utterance_id,
            frames: std::mem::take(&mut self.frames),
            sample_rate: self.sample_rate,
            forced: false,
        })
    }

    /// Drop the open utterance without producing a segment. Returns the
    /// number of frames discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        self.open = false;
        dropped
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}
