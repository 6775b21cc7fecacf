//! Input chain steps.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use super::markers::extract_markers;
use super::{PipelineContext, PipelineInput, PipelineStep};
use crate::error::{ParleyError, Result};
use crate::providers::Transcriber;

/// Turns an audio segment into text. Text input passes through untouched.
pub struct TranscriptionStep {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptionStep {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl PipelineStep for TranscriptionStep {
    fn name(&self) -> &'static str {
        "transcription"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<()> {
        let PipelineInput::Audio(segment) = &ctx.input else {
            return Ok(());
        };
        ctx.metadata
            .insert("utteranceId".into(), json!(segment.utterance_id));
        ctx.metadata
            .insert("audioSeconds".into(), json!(segment.duration_secs()));
        ctx.metadata.insert("forcedEnd".into(), json!(segment.forced));

        let text = self.transcriber.transcribe(segment).await.map_err(|e| {
            error!(utterance = segment.utterance_id, error = %e, "transcription failed");
            e.into_provider(ParleyError::Transcription)
        })?;
        debug!(utterance = segment.utterance_id, chars = text.len(), "transcribed");
        ctx.text = text;
        Ok(())
    }
}

/// Collapses whitespace and trims. Empty text short-circuits the turn.
pub struct NormalizeStep;

#[async_trait]
impl PipelineStep for NormalizeStep {
    fn name(&self) -> &'static str {
        "normalize"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<()> {
        let normalized = ctx.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            ctx.metadata.insert("emptyInput".into(), json!(true));
            ctx.short_circuit = true;
        }
        ctx.text = normalized;
        Ok(())
    }
}

/// Moves inline markers out of the user text into `ctx.markers`.
pub struct MarkerExtractionStep;

#[async_trait]
impl PipelineStep for MarkerExtractionStep {
    fn name(&self) -> &'static str {
        "markers"
    }

    async fn process(&self, ctx: &mut PipelineContext) -> Result<()> {
        let (cleaned, markers) = extract_markers(&ctx.text);
        if !markers.is_empty() {
            let labels: Vec<&str> = markers.iter().map(|m| m.label.as_str()).collect();
            ctx.metadata.insert("inputMarkers".into(), json!(labels));
        }
        if cleaned.is_empty() {
            ctx.metadata.insert("emptyInput".into(), json!(true));
            ctx.short_circuit = true;
        }
        ctx.text = cleaned;
        ctx.markers = markers;
        Ok(())
    }
}
