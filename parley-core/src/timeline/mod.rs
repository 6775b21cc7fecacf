//! Expression timeline and amplitude envelope for one spoken unit.
//!
//! Both outputs are scoped to a single synthesized utterance: the timeline
//! covers `[0, duration)` without gaps, the envelope has one value per
//! output frame.

pub mod envelope;

pub use envelope::AudioEnvelopeSampler;

use serde::{Deserialize, Serialize};

/// Label used for time not covered by any marker.
pub const NEUTRAL_LABEL: &str = "neutral";

/// Intensity for markers without an explicit value, and for neutral fill.
pub const DEFAULT_INTENSITY: f32 = 1.0;

/// Inline emotion annotation, positioned in the cleaned (tag-free) text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionMarker {
    pub label: String,
    /// Character offset where the marker takes effect.
    pub offset: usize,
    /// Character offset of a matching closing tag, if one was present.
    pub end_offset: Option<usize>,
    pub intensity: f32,
}

impl EmotionMarker {
    pub fn new(label: impl Into<String>, offset: usize) -> Self {
        Self {
            label: label.into(),
            offset,
            end_offset: None,
            intensity: DEFAULT_INTENSITY,
        }
    }
}

/// One labelled span of the animation schedule. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSegment {
    pub label: String,
    pub start: f64,
    pub duration: f64,
    pub intensity: f32,
}

impl TimelineSegment {
    fn neutral(start: f64, duration: f64) -> Self {
        Self {
            label: NEUTRAL_LABEL.to_string(),
            start,
            duration,
            intensity: DEFAULT_INTENSITY,
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Build a contiguous schedule covering exactly `[0, duration)`.
///
/// Marker character offsets map proportionally onto `duration` using
/// `text_len` (in characters). A marker holds until the next marker starts,
/// or until its closing tag; uncovered leading time and gaps left by closing
/// tags become `neutral`. The last segment always extends to `duration`.
///
/// When two markers land on the same instant the later one in text order wins.
/// A non-positive or non-finite `duration` yields an empty schedule.
pub fn build_timeline(
    markers: &[EmotionMarker],
    text_len: usize,
    duration: f64,
) -> Vec<TimelineSegment> {
    if !(duration.is_finite() && duration > 0.0) {
        return Vec::new();
    }

    let to_time = |offset: usize| -> f64 {
        if text_len == 0 {
            return 0.0;
        }
        (offset.min(text_len) as f64 / text_len as f64) * duration
    };

    let mut spans: Vec<(f64, Option<f64>, &EmotionMarker)> = markers
        .iter()
        .map(|m| (to_time(m.offset), m.end_offset.map(to_time), m))
        .collect();
    // Stable: equal times keep text order.
    spans.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut segments: Vec<TimelineSegment> = Vec::with_capacity(spans.len() * 2 + 1);
    let mut cursor = 0.0_f64;

    for (i, &(start, end, marker)) in spans.iter().enumerate() {
        let next_start = spans.get(i + 1).map_or(duration, |s| s.0);
        if next_start <= start || start >= duration {
            continue;
        }
        let end = end.map_or(next_start, |e| e.clamp(start, next_start));
        if end <= start {
            continue;
        }
        if start > cursor {
            segments.push(TimelineSegment::neutral(cursor, start - cursor));
        }
        segments.push(TimelineSegment {
            label: marker.label.clone(),
            start,
            duration: end - start,
            intensity: marker.intensity,
        });
        cursor = end;
    }

    match segments.last_mut() {
        None => segments.push(TimelineSegment::neutral(0.0, duration)),
        Some(last) => last.duration = duration - last.start,
    }
    segments
}
