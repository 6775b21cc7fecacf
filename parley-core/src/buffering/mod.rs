//! Audio containers: input frames, synthesized chunks, and the per-session
//! segment buffer that holds one utterance until it is flushed.

pub mod chunk;
pub mod frame;
pub mod segment;

pub use chunk::AudioChunk;
pub use frame::AudioFrame;
pub use segment::{Segment, SegmentBuffer};
