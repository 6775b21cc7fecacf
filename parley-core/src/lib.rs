//! # parley-core
//!
//! Real-time turn-taking engine for conversational voice agents.
//!
//! ## Architecture
//!
//! ```text
//! AudioFrame → VoiceActivityGate + SegmentBuffer (UtteranceCollector)
//!                         │ Segment
//!                         ▼
//!              input Pipeline (transcribe → normalize → markers)
//!                         │ text
//!                         ▼
//!              Generator::generate → FragmentStream
//!                         │
//!                         ▼
//!              OutputPipeline (sentences → text / audio+expression events)
//!                         │ OutputEvent (per-session seq)
//!                         ▼
//!              EventBus → consumers, by priority, failures isolated
//! ```
//!
//! `ConversationOrchestrator` owns one session's turn lifecycle and its
//! cooperative interrupt flag; `SessionSupervisor` owns the session map.
//! Capability backends plug in through `ProviderRegistry`.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod providers;
pub mod session;
pub mod timeline;
pub mod vad;

// Convenience re-exports for downstream crates
pub use config::EngineConfig;
pub use error::{ParleyError, Result};
pub use events::{EventBus, EventConsumer, EventKind, EventPayload, OutputEvent, Subscription};
pub use pipeline::PipelineInput;
pub use providers::{Fragment, Generator, ProviderRegistry, Synthesizer, Transcriber};
pub use session::{ConversationOrchestrator, SessionSupervisor, TurnResult, TurnState};
