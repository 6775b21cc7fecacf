use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-session counters, updated lock-free from the ingest path and the
/// turn task.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_in: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub utterances: AtomicU64,
    pub forced_ends: AtomicU64,
    pub turns_completed: AtomicU64,
    pub turns_interrupted: AtomicU64,
    pub turns_failed: AtomicU64,
    pub barge_ins: AtomicU64,
}

impl SessionDiagnostics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `events_emitted` comes from the session's emitter, which owns the
    /// sequence counter.
    pub fn snapshot(&self, events_emitted: u64) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            utterances: self.utterances.load(Ordering::Relaxed),
            forced_ends: self.forced_ends.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_interrupted: self.turns_interrupted.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            events_emitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub utterances: u64,
    pub forced_ends: u64,
    pub turns_completed: u64,
    pub turns_interrupted: u64,
    pub turns_failed: u64,
    pub barge_ins: u64,
    pub events_emitted: u64,
}
