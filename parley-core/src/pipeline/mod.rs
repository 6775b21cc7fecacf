//! Ordered processing chains.
//!
//! ## Input chain
//!
//! ```text
//! PipelineInput ─▶ TranscriptionStep ─▶ NormalizeStep ─▶ MarkerExtractionStep ─▶ ctx.text
//! ```
//!
//! Each step mutates the shared `PipelineContext`. A step that sets
//! `short_circuit` stops the chain without error (e.g. an empty
//! transcription); a step that fails stores its error in `ctx.error`, which
//! also halts the chain. Steps only touch the context, so a chain can be
//! built and replayed in isolation.
//!
//! ## Output chain
//!
//! `OutputPipeline` consumes the live generation stream, groups text into
//! sentence units and emits ordered events per unit. See `output`.

pub mod input;
pub mod markers;
pub mod output;

pub use input::{MarkerExtractionStep, NormalizeStep, TranscriptionStep};
pub use markers::extract_markers;
pub use output::{OutputOutcome, OutputPipeline, OutputStatus, SentenceAccumulator};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::buffering::Segment;
use crate::error::{ParleyError, Result};
use crate::events::Metadata;
use crate::providers::Transcriber;
use crate::session::InterruptFlag;
use crate::timeline::EmotionMarker;

/// Raw input of one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineInput {
    /// A completed utterance, still to be transcribed.
    Audio(Segment),
    /// Text typed by the user, used as-is.
    Text(String),
}

/// Mutable record threaded through one pipeline run.
#[derive(Debug)]
pub struct PipelineContext {
    pub input: PipelineInput,
    /// Derived user text (transcript, then normalized and tag-free).
    pub text: String,
    /// Response text accumulated so far.
    pub response: String,
    /// Markers found in the user text.
    pub markers: Vec<EmotionMarker>,
    pub metadata: Metadata,
    pub error: Option<ParleyError>,
    pub short_circuit: bool,
}

impl PipelineContext {
    pub fn new(input: PipelineInput) -> Self {
        let text = match &input {
            PipelineInput::Text(text) => text.clone(),
            PipelineInput::Audio(_) => String::new(),
        };
        Self {
            input,
            text,
            response: String::new(),
            markers: Vec::new(),
            metadata: Metadata::new(),
            error: None,
            short_circuit: false,
        }
    }

    pub fn halted(&self) -> bool {
        self.short_circuit || self.error.is_some()
    }
}

#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Transform the context. Returning `Err` halts the chain; the error is
    /// stored in `ctx.error`.
    async fn process(&self, ctx: &mut PipelineContext) -> Result<()>;
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    ShortCircuited,
    Failed,
    Interrupted,
}

#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard input chain: transcribe, normalize, extract markers.
    pub fn input(transcriber: Arc<dyn Transcriber>) -> Self {
        Self::new()
            .with_step(TranscriptionStep::new(transcriber))
            .with_step(NormalizeStep)
            .with_step(MarkerExtractionStep)
    }

    pub fn with_step(mut self, step: impl PipelineStep) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    ///
    /// The interrupt flag is checked before each step; once raised, no
    /// further step starts.
    pub async fn run(&self, ctx: &mut PipelineContext, interrupt: &InterruptFlag) -> RunOutcome {
        for step in &self.steps {
            if interrupt.is_raised() {
                debug!(step = step.name(), "interrupt pending, pipeline stopped");
                return RunOutcome::Interrupted;
            }
            let started = Instant::now();
            if let Err(e) = step.process(ctx).await {
                ctx.error = Some(e);
            }
            debug!(
                step = step.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "step finished"
            );
            if ctx.error.is_some() {
                return RunOutcome::Failed;
            }
            if ctx.short_circuit {
                return RunOutcome::ShortCircuited;
            }
        }
        RunOutcome::Completed
    }
}
