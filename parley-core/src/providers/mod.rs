//! Capability providers: transcription, generation, synthesis, scoring.
//!
//! The traits decouple the engine from any specific backend. Concrete
//! vendors live outside this crate; `stub` ships deterministic
//! implementations so the engine runs end-to-end without them.
//!
//! Backends are selected by configuration key through `ProviderRegistry`, an
//! explicitly constructed lookup table of factory functions.

pub mod registry;
pub mod stub;

pub use registry::{ProviderRegistry, Providers};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::buffering::{AudioChunk, Segment};
use crate::error::Result;

/// One incremental unit from the generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Plain text delta, possibly containing inline emotion markers.
    Text(String),
    /// Structured control fragment, e.g. a tool invocation.
    Control {
        name: String,
        arguments: serde_json::Value,
    },
}

impl Fragment {
    pub fn text(delta: impl Into<String>) -> Self {
        Fragment::Text(delta.into())
    }
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment>> + Send>>;

/// Synthesized audio, streamed. The total duration is known once the stream
/// is exhausted: the sum of the chunk durations.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<AudioChunk>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation history entry handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe one utterance. An empty string means no speech was recognised.
    ///
    /// # Errors
    /// Backend failures, reported as `ParleyError::Transcription`.
    async fn transcribe(&self, segment: &Segment) -> Result<String>;
}

/// Text generation backend.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Start generating a reply to `text`. `history` excludes `text` itself.
    ///
    /// The returned stream may be dropped before exhaustion on interrupt.
    async fn generate(&self, text: &str, history: &[ChatMessage]) -> Result<FragmentStream>;
}

/// Text-to-speech backend.
#[async_trait]
pub trait Synthesizer: Send + Sync + 'static {
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}
