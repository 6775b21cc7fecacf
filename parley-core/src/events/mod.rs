//! Output events and their delivery.
//!
//! ## Event types
//!
//! | `EventKind` | payload |
//! |-------------|---------|
//! | `TextFragment` | text, completion flag |
//! | `AudioChunk` | encoded audio |
//! | `AudioExpression` | encoded audio, envelope, timeline, cleaned text |
//! | `Control` | `ControlSignal` |
//! | `Error` | message |
//!
//! Every event carries the session id and a per-session sequence number.
//! Sequence numbers are assigned by the session's `EventEmitter` at emit
//! time, so they are strictly increasing without gaps for the lifetime of
//! the session.

pub mod bus;

pub use bus::{
    ChannelConsumer, DispatchReport, EventBus, EventConsumer, FnConsumer, Subscription,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::EncodedAudio;
use crate::timeline::TimelineSegment;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Subscription key: which payload variant a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    TextFragment,
    AudioChunk,
    AudioExpression,
    Control,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::TextFragment,
        EventKind::AudioChunk,
        EventKind::AudioExpression,
        EventKind::Control,
        EventKind::Error,
    ];
}

/// Turn-level and generator-level control signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlSignal {
    TurnStart,
    TurnEnd,
    Interrupted,
    /// Structured fragment from the generator, e.g. a tool invocation.
    Tool {
        name: String,
        arguments: serde_json::Value,
    },
}

impl ControlSignal {
    pub fn name(&self) -> &str {
        match self {
            ControlSignal::TurnStart => "turn-start",
            ControlSignal::TurnEnd => "turn-end",
            ControlSignal::Interrupted => "interrupted",
            ControlSignal::Tool { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    /// `complete` is set only on the terminal marker (empty text) that closes
    /// a normally finished output stream.
    #[serde(rename_all = "camelCase")]
    TextFragment { text: String, complete: bool },
    #[serde(rename_all = "camelCase")]
    AudioChunk { audio: EncodedAudio },
    #[serde(rename_all = "camelCase")]
    AudioExpression {
        audio: EncodedAudio,
        envelope: Vec<f32>,
        envelope_fps: u32,
        timeline: Vec<TimelineSegment>,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Control { signal: ControlSignal },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::TextFragment { .. } => EventKind::TextFragment,
            EventPayload::AudioChunk { .. } => EventKind::AudioChunk,
            EventPayload::AudioExpression { .. } => EventKind::AudioExpression,
            EventPayload::Control { .. } => EventKind::Control,
            EventPayload::Error { .. } => EventKind::Error,
        }
    }
}

/// Immutable unit of produced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub session_id: String,
    /// Per-session sequence number.
    pub seq: u64,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl OutputEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// True for the terminal marker of a normally completed output stream.
    pub fn is_complete_marker(&self) -> bool {
        matches!(self.payload, EventPayload::TextFragment { complete: true, .. })
    }
}

/// Session-scoped event source: stamps session id and sequence number, then
/// hands the event to the shared bus.
///
/// Sequence numbers are never reused; an emitter is created once per
/// session and shared by every turn of that session. The sequence lock is
/// held through dispatch, so every subscriber sees a session's events in
/// sequence order even when clones emit from several threads. Consumers
/// must not emit on the same session from inside `on_event`.
#[derive(Clone)]
pub struct EventEmitter {
    session_id: Arc<str>,
    next_seq: Arc<Mutex<u64>>,
    bus: Arc<EventBus>,
}

impl EventEmitter {
    pub fn new(session_id: impl Into<Arc<str>>, bus: Arc<EventBus>) -> Self {
        Self {
            session_id: session_id.into(),
            next_seq: Arc::new(Mutex::new(0)),
            bus,
        }
    }

    /// Stamp and dispatch an event. Returns its sequence number.
    pub fn emit(&self, payload: EventPayload) -> u64 {
        self.emit_with(payload, Metadata::new())
    }

    pub fn emit_with(&self, payload: EventPayload, metadata: Metadata) -> u64 {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;
        let event = OutputEvent {
            session_id: self.session_id.to_string(),
            seq,
            payload,
            metadata,
            created_at: Utc::now(),
        };
        self.bus.emit(&event);
        seq
    }

    /// Number of events emitted so far (also the next sequence number).
    pub fn emitted(&self) -> u64 {
        *self.next_seq.lock()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
