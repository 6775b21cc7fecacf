//! Inline emotion markers.
//!
//! Syntax: `[label]`, `[label:0.7]` (intensity in `[0, 1]`) and the closing
//! form `[/label]`. Labels are ASCII alphanumerics, `_` or `-`. Anything else
//! in brackets (e.g. `[stub: 12 samples]`) is ordinary text.
//!
//! Markers are removed from the text and whitespace runs are collapsed, so
//! `"Hi [happy] there"` becomes `"Hi there"`. Offsets count characters of
//! that cleaned text.

use crate::timeline::EmotionMarker;

enum Tag<'a> {
    Open { label: &'a str, intensity: Option<f32> },
    Close { label: &'a str },
}

/// Strip markers from `text`, returning the cleaned text and the markers in
/// text order.
pub fn extract_markers(text: &str) -> (String, Vec<EmotionMarker>) {
    let mut cleaned = String::with_capacity(text.len());
    let mut cleaned_chars = 0usize;
    let mut markers: Vec<EmotionMarker> = Vec::new();
    let mut rest = text;

    while let Some(ch) = rest.chars().next() {
        if ch == '[' {
            if let Some(close) = rest.find(']') {
                if let Some(tag) = parse_tag(&rest[1..close]) {
                    match tag {
                        Tag::Open { label, intensity } => {
                            let mut marker = EmotionMarker::new(label, cleaned_chars);
                            if let Some(intensity) = intensity {
                                marker.intensity = intensity;
                            }
                            markers.push(marker);
                        }
                        Tag::Close { label } => {
                            // Closes the most recent open marker with that label.
                            if let Some(open) = markers
                                .iter_mut()
                                .rev()
                                .find(|m| m.label == label && m.end_offset.is_none())
                            {
                                open.end_offset = Some(cleaned_chars);
                            }
                        }
                    }
                    rest = &rest[close + 1..];
                    continue;
                }
            }
        }

        if ch.is_whitespace() && (cleaned.is_empty() || cleaned.ends_with(char::is_whitespace)) {
            // Leading or repeated whitespace.
        } else {
            cleaned.push(ch);
            cleaned_chars += 1;
        }
        rest = &rest[ch.len_utf8()..];
    }

    let trimmed_len = cleaned.trim_end().len();
    if trimmed_len < cleaned.len() {
        cleaned.truncate(trimmed_len);
        let len = cleaned.chars().count();
        for marker in &mut markers {
            marker.offset = marker.offset.min(len);
            marker.end_offset = marker.end_offset.map(|end| end.min(len));
        }
    }
    (cleaned, markers)
}

fn parse_tag(inner: &str) -> Option<Tag<'_>> {
    if let Some(label) = inner.strip_prefix('/') {
        return is_label(label).then_some(Tag::Close { label });
    }
    let (label, intensity) = match inner.split_once(':') {
        Some((label, value)) => {
            let value: f32 = value.trim().parse().ok()?;
            if !value.is_finite() {
                return None;
            }
            (label, Some(value.clamp(0.0, 1.0)))
        }
        None => (inner, None),
    };
    is_label(label).then_some(Tag::Open { label, intensity })
}

fn is_label(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
