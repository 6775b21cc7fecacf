use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("session is busy with an active turn")]
    Busy,

    #[error("no active turn to interrupt")]
    NotActive,

    #[error("no utterance is open")]
    NoOpenUtterance,

    #[error("segment is empty")]
    EmptySegment,

    #[error("segment buffer is full ({max_frames} frames)")]
    SegmentFull { max_frames: usize },

    #[error("malformed audio frame: {0}")]
    MalformedFrame(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("pipeline step `{step}` failed: {message}")]
    Step { step: &'static str, message: String },

    #[error("unknown {kind} provider: {key}")]
    UnknownProvider { kind: &'static str, key: String },

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("audio encoding error: {0}")]
    Encoding(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// True for failures raised by a transcription, generation or synthesis
    /// backend. These end the active turn but leave the session usable.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            ParleyError::Transcription(_) | ParleyError::Generation(_) | ParleyError::Synthesis(_)
        )
    }

    /// Keep provider failures as they are; wrap anything else a backend
    /// returned with `wrap`, so every backend error reaches the turn as a
    /// provider failure.
    pub fn into_provider(self, wrap: fn(String) -> ParleyError) -> ParleyError {
        if self.is_provider_failure() {
            self
        } else {
            wrap(self.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
