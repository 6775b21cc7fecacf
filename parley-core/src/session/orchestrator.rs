//! Session-scoped turn coordinator.
//!
//! ## Turn lifecycle
//!
//! ```text
//!            submit()                 input chain done
//!   Idle ───────────────▶ Collecting ──────────────────▶ Generating
//!    ▲                       │  interrupt()                  │  interrupt()
//!    │                       ▼                               ▼
//!    └──────────────────── Interrupted ◀─────────────────────┘
//!    └───────────── turn end / failure ◀─────────────────────┘
//! ```
//!
//! One turn at a time: `submit` fails with `Busy` unless the session is
//! `Idle`. Interrupts are cooperative (see `InterruptFlag`). A turn closes
//! the flag once its outcome is settled, so an accepted interrupt is always
//! reported by the turn; the flag is re-armed under the state lock when the
//! turn ends, so a stale interrupt never leaks into the next turn.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};
use super::InterruptFlag;
use crate::buffering::{AudioFrame, Segment, SegmentBuffer};
use crate::config::EngineConfig;
use crate::error::{ParleyError, Result};
use crate::events::{ControlSignal, EventBus, EventEmitter, EventPayload, Metadata};
use crate::pipeline::{OutputPipeline, OutputStatus, Pipeline, PipelineContext, PipelineInput, RunOutcome};
use crate::providers::{ChatMessage, Providers};
use crate::vad::{CollectorEvent, UtteranceCollector, VoiceActivityGate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnState {
    Idle,
    Collecting,
    Generating,
    Interrupted,
}

/// Outcome of one turn.
///
/// An interrupted turn is not a failure: `success` is true and
/// `response_text` holds whatever was dispatched before the interrupt.
#[derive(Debug)]
pub struct TurnResult {
    pub turn: u64,
    pub success: bool,
    pub interrupted: bool,
    /// Normalized user text (empty if the input never got that far).
    pub transcript: String,
    pub response_text: String,
    pub error: Option<ParleyError>,
}

enum Ending {
    Completed,
    Interrupted,
    Failed(ParleyError),
}

pub struct ConversationOrchestrator {
    session_id: Arc<str>,
    config: EngineConfig,
    providers: Providers,
    input: Pipeline,
    output: OutputPipeline,
    emitter: EventEmitter,
    state: Mutex<TurnState>,
    interrupt: InterruptFlag,
    history: Mutex<VecDeque<ChatMessage>>,
    collector: Mutex<UtteranceCollector>,
    diagnostics: SessionDiagnostics,
    turns: AtomicU64,
}

impl ConversationOrchestrator {
    /// Build a session. The scorer is created fresh from `providers`; the
    /// other providers are shared.
    pub fn new(
        session_id: &str,
        config: EngineConfig,
        providers: Providers,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let session_id: Arc<str> = Arc::from(session_id);
        let scorer = providers.new_scorer(&config)?;
        let gate = VoiceActivityGate::new(config.gate.clone(), scorer);
        let buffer = SegmentBuffer::new(config.segment.max_frames, config.gate.sample_rate);
        let collector = UtteranceCollector::new(gate, buffer, config.preroll_frames());
        let input = Pipeline::input(Arc::clone(&providers.transcriber));
        let output = OutputPipeline::new(Arc::clone(&providers.synthesizer), config.output.clone());
        let emitter = EventEmitter::new(Arc::clone(&session_id), bus);

        debug!(session = %session_id, "session created");
        Ok(Self {
            session_id,
            config,
            providers,
            input,
            output,
            emitter,
            state: Mutex::new(TurnState::Idle),
            interrupt: InterruptFlag::new(),
            history: Mutex::new(VecDeque::new()),
            collector: Mutex::new(collector),
            diagnostics: SessionDiagnostics::default(),
            turns: AtomicU64::new(0),
        })
    }

    /// Replace the input chain.
    pub fn with_input_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.input = pipeline;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot(self.emitter.emitted())
    }

    // ── Turns ────────────────────────────────────────────────────────────────

    /// Run one full turn: input chain, generation, output chain.
    ///
    /// # Errors
    /// `Busy` if a turn is already active. Every other failure is reported
    /// inside the `TurnResult`, with an error event emitted.
    pub async fn submit(&self, input: PipelineInput) -> Result<TurnResult> {
        {
            let mut state = self.state.lock();
            if *state != TurnState::Idle {
                return Err(ParleyError::Busy);
            }
            *state = TurnState::Collecting;
        }
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session = %self.session_id, turn, "turn started");
        self.emit_control(ControlSignal::TurnStart, turn);

        let mut ctx = PipelineContext::new(input);
        let outcome = self.input.run(&mut ctx, &self.interrupt).await;
        let (response, ending) = match outcome {
            RunOutcome::Completed => self.generate(&ctx.text, turn).await,
            RunOutcome::ShortCircuited => {
                debug!(session = %self.session_id, turn, "empty input, no generation");
                (String::new(), Ending::Completed)
            }
            RunOutcome::Interrupted => (String::new(), Ending::Interrupted),
            RunOutcome::Failed => {
                let e = ctx.error.take().unwrap_or_else(|| ParleyError::Step {
                    step: "input",
                    message: "step failed without an error".into(),
                });
                (String::new(), Ending::Failed(e))
            }
        };
        Ok(self.finish(turn, ctx.text, response, ending))
    }

    async fn generate(&self, text: &str, turn: u64) -> (String, Ending) {
        {
            let mut state = self.state.lock();
            if self.interrupt.is_raised() {
                return (String::new(), Ending::Interrupted);
            }
            *state = TurnState::Generating;
        }

        let history = self.history();
        let stream = match self.providers.generator.generate(text, &history).await {
            Ok(stream) => stream,
            Err(e) => return (String::new(), Ending::Failed(e.into_provider(ParleyError::Generation))),
        };
        let outcome = self
            .output
            .run(stream, &self.interrupt, &self.emitter, turn)
            .await;
        let ending = match outcome.status {
            OutputStatus::Completed => Ending::Completed,
            OutputStatus::Interrupted => Ending::Interrupted,
            OutputStatus::Failed(e) => Ending::Failed(e),
        };
        (outcome.response_text, ending)
    }

    fn finish(&self, turn: u64, transcript: String, response: String, ending: Ending) -> TurnResult {
        // Settle the outcome: an interrupt accepted before this point wins,
        // and any interrupt after it is refused.
        let ending = match ending {
            Ending::Interrupted => Ending::Interrupted,
            settled if self.interrupt.close() => settled,
            settled => {
                if let Ending::Failed(e) = &settled {
                    warn!(session = %self.session_id, turn, error = %e, "failure superseded by interrupt");
                }
                Ending::Interrupted
            }
        };
        let (success, interrupted, error) = match ending {
            Ending::Completed => {
                self.emit_control(ControlSignal::TurnEnd, turn);
                SessionDiagnostics::bump(&self.diagnostics.turns_completed);
                info!(session = %self.session_id, turn, chars = response.len(), "turn complete");
                (true, false, None)
            }
            Ending::Interrupted => {
                *self.state.lock() = TurnState::Interrupted;
                self.emit_control(ControlSignal::Interrupted, turn);
                SessionDiagnostics::bump(&self.diagnostics.turns_interrupted);
                info!(session = %self.session_id, turn, partial_chars = response.len(), "turn interrupted");
                (true, true, None)
            }
            Ending::Failed(e) => {
                error!(session = %self.session_id, turn, error = %e, "turn failed");
                self.emitter.emit_with(
                    EventPayload::Error {
                        message: e.to_string(),
                    },
                    turn_metadata(turn),
                );
                self.emit_control(ControlSignal::TurnEnd, turn);
                SessionDiagnostics::bump(&self.diagnostics.turns_failed);
                (false, false, Some(e))
            }
        };

        if success && !transcript.is_empty() {
            self.record_history(&transcript, &response);
        }

        {
            let mut state = self.state.lock();
            self.interrupt.clear();
            *state = TurnState::Idle;
        }

        TurnResult {
            turn,
            success,
            interrupted,
            transcript,
            response_text: response,
            error,
        }
    }

    fn record_history(&self, user: &str, assistant: &str) {
        let limit = self.config.session.history_limit;
        let mut history = self.history.lock();
        history.push_back(ChatMessage::user(user));
        if !assistant.is_empty() {
            history.push_back(ChatMessage::assistant(assistant));
        }
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn emit_control(&self, signal: ControlSignal, turn: u64) {
        self.emitter
            .emit_with(EventPayload::Control { signal }, turn_metadata(turn));
    }

    // ── Interrupts ───────────────────────────────────────────────────────────

    /// Request cancellation of the active turn.
    ///
    /// Also discards any utterance being collected, since it belongs to the
    /// input being abandoned. Returns `Ok(false)` if an interrupt is already
    /// pending or the turn has already settled its outcome; nothing is
    /// discarded then.
    ///
    /// # Errors
    /// `NotActive` if no turn is running.
    pub fn interrupt(&self) -> Result<bool> {
        let raised = self.raise_interrupt()?;
        if raised {
            let dropped = self.collector.lock().discard();
            if dropped > 0 {
                debug!(session = %self.session_id, frames = dropped, "collected utterance discarded");
            }
        }
        Ok(raised)
    }

    fn raise_interrupt(&self) -> Result<bool> {
        let state = self.state.lock();
        match *state {
            TurnState::Idle => Err(ParleyError::NotActive),
            TurnState::Interrupted => Ok(false),
            TurnState::Collecting | TurnState::Generating => {
                let raised = self.interrupt.raise();
                if raised {
                    info!(session = %self.session_id, state = ?*state, "interrupt requested");
                }
                Ok(raised)
            }
        }
    }

    // ── Audio ────────────────────────────────────────────────────────────────

    /// Feed one frame through the gate.
    ///
    /// Returns the completed segment when an utterance ends. When speech
    /// starts while the session is generating and barge-in is enabled, the
    /// active turn is interrupted; the new utterance is kept.
    ///
    /// # Errors
    /// `MalformedFrame` if the frame was dropped.
    pub fn ingest_frame(&self, frame: AudioFrame) -> Result<Option<Segment>> {
        SessionDiagnostics::bump(&self.diagnostics.frames_in);
        let pushed = self.collector.lock().push(frame);
        let event = match pushed {
            Ok(event) => event,
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.frames_dropped);
                return Err(e);
            }
        };

        match event {
            Some(CollectorEvent::Started { utterance_id }) => {
                SessionDiagnostics::bump(&self.diagnostics.utterances);
                if self.config.session.barge_in
                    && self.state() == TurnState::Generating
                    && matches!(self.raise_interrupt(), Ok(true))
                {
                    SessionDiagnostics::bump(&self.diagnostics.barge_ins);
                    info!(session = %self.session_id, utterance = utterance_id, "barge-in");
                }
                Ok(None)
            }
            Some(CollectorEvent::Completed(segment)) => {
                if segment.forced {
                    SessionDiagnostics::bump(&self.diagnostics.forced_ends);
                }
                Ok(Some(segment))
            }
            None => Ok(None),
        }
    }

    /// Drive the session from a frame stream until it ends.
    ///
    /// Each completed utterance becomes a turn on its own task, so frames keep
    /// flowing (and barge-in keeps working) while a turn runs. A new turn
    /// waits for the previous one to end. Returns the results in turn order.
    pub async fn run_audio<S>(self: &Arc<Self>, mut frames: S) -> Vec<TurnResult>
    where
        S: Stream<Item = AudioFrame> + Unpin,
    {
        let mut results = Vec::new();
        let mut in_flight: Option<JoinHandle<Result<TurnResult>>> = None;

        while let Some(frame) = frames.next().await {
            let segment = match self.ingest_frame(frame) {
                Ok(Some(segment)) => segment,
                Ok(None) | Err(ParleyError::MalformedFrame(_)) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    warn!(session = %self.session_id, error = %e, "frame ingest failed");
                    continue;
                }
            };
            if let Some(previous) = in_flight.take() {
                self.collect(previous.await, &mut results);
            }
            let this = Arc::clone(self);
            in_flight = Some(tokio::spawn(async move {
                this.submit(PipelineInput::Audio(segment)).await
            }));
            tokio::task::yield_now().await;
        }

        if let Some(last) = in_flight.take() {
            self.collect(last.await, &mut results);
        }
        results
    }

    fn collect(
        &self,
        joined: std::result::Result<Result<TurnResult>, tokio::task::JoinError>,
        results: &mut Vec<TurnResult>,
    ) {
        match joined {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(e)) => warn!(session = %self.session_id, error = %e, "utterance not submitted"),
            Err(e) => error!(session = %self.session_id, error = %e, "turn task aborted"),
        }
    }
}

fn turn_metadata(turn: u64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("turn".into(), json!(turn));
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, OutputEvent};
    use crate::providers::stub::ScriptedGenerator;
    use crate::providers::{Fragment, FragmentStream, Generator, ProviderRegistry};
    use async_trait::async_trait;
    use std::time::Duration;

    fn session_on(bus: Arc<EventBus>, generator: impl Generator) -> Arc<ConversationOrchestrator> {
        let config = EngineConfig::default();
        let mut providers = ProviderRegistry::builtin().build(&config).unwrap();
        providers.generator = Arc::new(generator);
        Arc::new(ConversationOrchestrator::new("s-1", config, providers, bus).unwrap())
    }

    fn session_with(
        generator: impl Generator,
    ) -> (Arc<ConversationOrchestrator>, Arc<parking_lot::Mutex<Vec<OutputEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn(kind, 0, move |ev| {
                seen.lock().push(ev.clone());
                Ok(())
            });
        }
        (session_on(bus, generator), seen)
    }

    type Slot = Arc<parking_lot::Mutex<Option<Arc<ConversationOrchestrator>>>>;

    /// Subscribe a consumer that calls `interrupt()` on the first event
    /// matching `when`, recording what it returned.
    fn interrupt_on(
        bus: &EventBus,
        when: fn(&OutputEvent) -> bool,
    ) -> (Slot, Arc<parking_lot::Mutex<Vec<std::result::Result<bool, String>>>>) {
        let slot: Slot = Default::default();
        let replies = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let slot = Arc::clone(&slot);
            let replies = Arc::clone(&replies);
            bus.subscribe_fn(EventKind::TextFragment, 10, move |ev| {
                if when(ev) && replies.lock().is_empty() {
                    if let Some(session) = slot.lock().as_ref() {
                        replies.lock().push(session.interrupt().map_err(|e| e.to_string()));
                    }
                }
                Ok(())
            });
        }
        (slot, replies)
    }

    fn signals(events: &[OutputEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Control { signal } => Some(signal.name().to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn text_turn_runs_to_completion() {
        let (session, seen) = session_with(ScriptedGenerator::from_text(["Sure thing. ", "Bye."]));
        let result = session
            .submit(PipelineInput::Text("hello".into()))
            .await
            .unwrap();

        assert!(result.success && !result.interrupted);
        assert_eq!(result.response_text, "Sure thing. Bye.");
        assert_eq!(session.state(), TurnState::Idle);
        assert_eq!(
            session.history(),
            vec![ChatMessage::user("hello"), ChatMessage::assistant("Sure thing. Bye.")]
        );

        let events = seen.lock();
        assert_eq!(signals(&events), vec!["turn-start", "turn-end"]);
        assert!(events.iter().any(OutputEvent::is_complete_marker));
        assert_eq!(session.diagnostics().turns_completed, 1);
    }

    #[tokio::test]
    async fn empty_text_short_circuits_without_generation() {
        let (session, seen) = session_with(ScriptedGenerator::from_text(["never"]));
        let result = session.submit(PipelineInput::Text("   ".into())).await.unwrap();
        assert!(result.success);
        assert!(result.response_text.is_empty());
        assert_eq!(signals(&seen.lock()), vec!["turn-start", "turn-end"]);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn interrupt_while_idle_is_rejected() {
        let (session, _) = session_with(ScriptedGenerator::default());
        assert!(matches!(session.interrupt(), Err(ParleyError::NotActive)));
    }

    #[tokio::test]
    async fn second_submit_is_busy_and_interrupt_yields_partial_result() {
        let generator = ScriptedGenerator::from_text([
            "First sentence here. ",
            "Second sentence here. ",
            "Third sentence here. ",
        ])
        .with_delay(Duration::from_millis(40));
        let (session, seen) = session_with(generator);

        let turn = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.submit(PipelineInput::Text("go".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            session.submit(PipelineInput::Text("again".into())).await,
            Err(ParleyError::Busy)
        ));
        assert!(session.interrupt().unwrap());
        assert!(!session.interrupt().unwrap(), "already pending");

        let result = turn.await.unwrap().unwrap();
        assert!(result.success && result.interrupted);
        assert!(result.response_text.starts_with("First sentence here."));
        assert!(!result.response_text.contains("Third"));
        assert_eq!(session.state(), TurnState::Idle);

        let events = seen.lock();
        let last = events.last().unwrap();
        assert!(matches!(
            last.payload,
            EventPayload::Control { signal: ControlSignal::Interrupted }
        ));
        assert!(!events.iter().any(OutputEvent::is_complete_marker));
        drop(events);

        // The session is usable again and the flag does not leak.
        let next = session.submit(PipelineInput::Text("hi".into())).await.unwrap();
        assert!(!next.interrupted);
    }

    struct BrokenGenerator;

    #[async_trait]
    impl Generator for BrokenGenerator {
        async fn generate(&self, _text: &str, _history: &[ChatMessage]) -> Result<FragmentStream> {
            Err(ParleyError::Config("quota exceeded".into()))
        }
    }

    #[tokio::test]
    async fn provider_failure_ends_turn_with_one_error_event() {
        let (session, seen) = session_with(BrokenGenerator);
        let result = session.submit(PipelineInput::Text("hi".into())).await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.error, Some(ParleyError::Generation(_))));
        assert_eq!(session.state(), TurnState::Idle);

        let events = seen.lock();
        let errors = events.iter().filter(|e| e.kind() == EventKind::Error).count();
        assert_eq!(errors, 1);
        assert_eq!(signals(&events), vec!["turn-start", "turn-end"]);
        assert_eq!(session.diagnostics().turns_failed, 1);
    }

    #[tokio::test]
    async fn control_fragments_reach_the_bus() {
        let generator = ScriptedGenerator::new(vec![Fragment::Control {
            name: "lookup".into(),
            arguments: json!({ "q": "x" }),
        }]);
        let (session, seen) = session_with(generator);
        session.submit(PipelineInput::Text("hi".into())).await.unwrap();
        assert_eq!(signals(&seen.lock()), vec!["turn-start", "lookup", "turn-end"]);
    }

    #[tokio::test]
    async fn interrupt_after_terminal_marker_is_refused() {
        let bus = Arc::new(EventBus::new());
        let (slot, replies) = interrupt_on(&bus, OutputEvent::is_complete_marker);
        let session = session_on(Arc::clone(&bus), ScriptedGenerator::from_text(["All done."]));
        *slot.lock() = Some(Arc::clone(&session));

        let result = session.submit(PipelineInput::Text("hi".into())).await.unwrap();
        slot.lock().take();

        assert_eq!(*replies.lock(), vec![Ok::<bool, String>(false)]);
        assert!(result.success && !result.interrupted);
        let diag = session.diagnostics();
        assert_eq!((diag.turns_completed, diag.turns_interrupted), (1, 0));
    }

    #[tokio::test]
    async fn interrupt_before_terminal_marker_is_honored() {
        let bus = Arc::new(EventBus::new());
        let (slot, replies) = interrupt_on(&bus, |ev| !ev.is_complete_marker());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn(kind, 0, move |ev| {
                seen.lock().push(ev.clone());
                Ok(())
            });
        }
        let session = session_on(Arc::clone(&bus), ScriptedGenerator::from_text(["Only sentence."]));
        *slot.lock() = Some(Arc::clone(&session));

        let result = session.submit(PipelineInput::Text("hi".into())).await.unwrap();
        slot.lock().take();

        assert_eq!(*replies.lock(), vec![Ok::<bool, String>(true)]);
        assert!(result.interrupted);
        assert_eq!(result.response_text, "Only sentence.");
        let events = seen.lock();
        assert!(!events.iter().any(OutputEvent::is_complete_marker));
        assert_eq!(signals(&events), vec!["turn-start", "interrupted"]);
        assert_eq!(session.diagnostics().turns_interrupted, 1);
    }

    #[tokio::test]
    async fn interrupt_accepted_before_settling_is_reported() {
        let (session, seen) = session_with(ScriptedGenerator::default());
        *session.state.lock() = TurnState::Generating;
        assert!(session.interrupt().unwrap());

        let result = session.finish(7, "hi".into(), "partial".into(), Ending::Completed);
        assert!(result.interrupted);
        assert_eq!(session.state(), TurnState::Idle);
        assert_eq!(session.diagnostics().turns_interrupted, 1);
        assert_eq!(signals(&seen.lock()), vec!["interrupted"]);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (session, _) = session_with(ScriptedGenerator::from_text(["ok."]));
        for i in 0..15 {
            session
                .submit(PipelineInput::Text(format!("msg {i}")))
                .await
                .unwrap();
        }
        let history = session.history();
        assert_eq!(history.len(), 20);
        assert_eq!(history.last(), Some(&ChatMessage::assistant("ok.")));
    }
}
