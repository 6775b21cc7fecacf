//! Output chain: generation stream → sentence units → ordered events.
//!
//! ## Per unit
//!
//! ```text
//! raw unit ─▶ extract markers ─▶ TextFragment ─▶ synthesize ─┬▶ AudioExpression (emitExpression)
//!                                                            └▶ AudioChunk × n
//! ```
//!
//! A unit's events are all emitted before the next unit starts. When the
//! stream is exhausted a terminal `TextFragment { text: "", complete: true }`
//! closes the output. The interrupt flag is closed just before it, so an
//! interrupt either stops the run first or is refused. On interrupt nothing
//! further is emitted, including the terminal marker, so consumers can tell
//! completion from interruption.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, error};

use super::markers::extract_markers;
use crate::buffering::AudioChunk;
use crate::codec;
use crate::config::OutputConfig;
use crate::error::{ParleyError, Result};
use crate::events::{ControlSignal, EventEmitter, EventPayload, Metadata};
use crate::providers::{Fragment, FragmentStream, Synthesizer};
use crate::session::InterruptFlag;
use crate::timeline::{build_timeline, AudioEnvelopeSampler, EmotionMarker};

const TERMINATORS: [char; 4] = ['.', '!', '?', '\n'];

/// Groups streamed text deltas into sentence-sized units.
///
/// A unit closes at a terminator followed by whitespace, once at least
/// `min_chars` are buffered. Terminators inside an unclosed `[...]` never
/// split, so `[happy:0.5]` survives. Past `max_chars` without a terminator
/// the buffer is split at the last whitespace, or before an open marker that
/// straddles the limit.
#[derive(Debug, Clone)]
pub struct SentenceAccumulator {
    buf: String,
    min_chars: usize,
    max_chars: usize,
}

impl SentenceAccumulator {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            min_chars,
            max_chars: max_chars.max(min_chars).max(1),
        }
    }

    /// Append a delta and return every unit it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut units = Vec::new();
        while let Some(at) = self.split_point() {
            let rest = self.buf.split_off(at);
            let unit = std::mem::replace(&mut self.buf, rest);
            let unit = unit.trim();
            if !unit.is_empty() {
                units.push(unit.to_string());
            }
        }
        units
    }

    /// Take whatever remains, if anything but whitespace.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn pending(&self) -> &str {
        &self.buf
    }

    /// Byte index to split the buffer at, if a unit is complete.
    fn split_point(&self) -> Option<usize> {
        // Byte index of the unclosed `[`, if any.
        let mut tag_start: Option<usize> = None;
        let mut chars = 0usize;
        let mut last_space: Option<usize> = None;
        let mut iter = self.buf.char_indices().peekable();

        while let Some((i, c)) = iter.next() {
            chars += 1;
            match c {
                '[' => tag_start = Some(i),
                ']' => tag_start = None,
                _ => {}
            }
            let in_tag = tag_start.is_some();
            let end = i + c.len_utf8();
            if TERMINATORS.contains(&c) && !in_tag && chars >= self.min_chars {
                if c == '\n' {
                    return Some(end);
                }
                if let Some((_, next)) = iter.peek() {
                    if next.is_whitespace() {
                        return Some(end);
                    }
                }
            }
            if c.is_whitespace() && chars > 1 {
                last_space = Some(i);
            }
            if chars >= self.max_chars && iter.peek().is_some() {
                // Never cut a marker in half; a bracket opening the buffer
                // is too long to be one.
                return Some(match tag_start {
                    Some(tag) if tag > 0 => tag,
                    _ => last_space.unwrap_or(end),
                });
            }
        }
        None
    }
}

/// How an output run ended.
#[derive(Debug)]
pub enum OutputStatus {
    Completed,
    Interrupted,
    Failed(ParleyError),
}

#[derive(Debug)]
pub struct OutputOutcome {
    /// Cleaned text of every unit whose text event was emitted.
    pub response_text: String,
    pub units: usize,
    pub status: OutputStatus,
}

enum Flow {
    Continue,
    Interrupted,
}

/// Per-run mutable state.
struct RunState<'a> {
    interrupt: &'a InterruptFlag,
    emitter: &'a EventEmitter,
    turn: u64,
    response: String,
    units: usize,
    /// Unclosed marker from the previous unit, carried into the next.
    carried: Option<EmotionMarker>,
}

impl RunState<'_> {
    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("turn".into(), json!(self.turn));
        metadata.insert("unit".into(), json!(self.units));
        metadata
    }

    fn emit(&self, payload: EventPayload) -> Flow {
        if self.interrupt.is_raised() {
            return Flow::Interrupted;
        }
        self.emitter.emit_with(payload, self.metadata());
        Flow::Continue
    }

    fn finish(self, status: OutputStatus) -> OutputOutcome {
        OutputOutcome {
            response_text: self.response,
            units: self.units,
            status,
        }
    }
}

pub struct OutputPipeline {
    synthesizer: Arc<dyn Synthesizer>,
    config: OutputConfig,
    envelope: AudioEnvelopeSampler,
}

impl OutputPipeline {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, config: OutputConfig) -> Self {
        let envelope = AudioEnvelopeSampler::new(config.envelope_fps);
        Self {
            synthesizer,
            config,
            envelope,
        }
    }

    /// Drain `fragments`, emitting events through `emitter`.
    ///
    /// `interrupt` is checked before every fragment, every unit, every audio
    /// chunk and every emit.
    pub async fn run(
        &self,
        mut fragments: FragmentStream,
        interrupt: &InterruptFlag,
        emitter: &EventEmitter,
        turn: u64,
    ) -> OutputOutcome {
        let mut acc = SentenceAccumulator::new(
            self.config.min_sentence_chars,
            self.config.max_sentence_chars,
        );
        let mut state = RunState {
            interrupt,
            emitter,
            turn,
            response: String::new(),
            units: 0,
            carried: None,
        };

        loop {
            if interrupt.is_raised() {
                return state.finish(OutputStatus::Interrupted);
            }
            let Some(next) = fragments.next().await else {
                break;
            };
            let flow = match next {
                Ok(Fragment::Text(delta)) => {
                    let mut flow = Ok(Flow::Continue);
                    for unit in acc.push(&delta) {
                        flow = self.emit_unit(&unit, &mut state).await;
                        if !matches!(flow, Ok(Flow::Continue)) {
                            break;
                        }
                    }
                    flow
                }
                Ok(Fragment::Control { name, arguments }) => {
                    let flushed = match acc.flush() {
                        Some(unit) => self.emit_unit(&unit, &mut state).await,
                        None => Ok(Flow::Continue),
                    };
                    match flushed {
                        Ok(Flow::Continue) => Ok(state.emit(EventPayload::Control {
                            signal: ControlSignal::Tool { name, arguments },
                        })),
                        other => other,
                    }
                }
                Err(e) => {
                    error!(turn, error = %e, "generation stream failed");
                    Err(e.into_provider(ParleyError::Generation))
                }
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Interrupted) => return state.finish(OutputStatus::Interrupted),
                Err(e) => return state.finish(OutputStatus::Failed(e)),
            }
        }

        if let Some(unit) = acc.flush() {
            match self.emit_unit(&unit, &mut state).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Interrupted) => return state.finish(OutputStatus::Interrupted),
                Err(e) => return state.finish(OutputStatus::Failed(e)),
            }
        }

        // Past this point the turn is settled; later interrupts are refused.
        if !interrupt.close() {
            return state.finish(OutputStatus::Interrupted);
        }
        let terminal = EventPayload::TextFragment {
            text: String::new(),
            complete: true,
        };
        match state.emit(terminal) {
            Flow::Continue => {
                debug!(turn, units = state.units, "output complete");
                state.finish(OutputStatus::Completed)
            }
            Flow::Interrupted => state.finish(OutputStatus::Interrupted),
        }
    }

    async fn emit_unit(&self, raw: &str, state: &mut RunState<'_>) -> Result<Flow> {
        let (text, mut markers) = extract_markers(raw);
        if let Some(carried) = state.carried.take() {
            if markers.first().map_or(true, |m| m.offset > 0) {
                markers.insert(0, EmotionMarker { offset: 0, ..carried });
            }
        }
        state.carried = markers
            .last()
            .filter(|m| m.end_offset.is_none())
            .cloned();
        if text.is_empty() {
            return Ok(Flow::Continue);
        }

        if let Flow::Interrupted = state.emit(EventPayload::TextFragment {
            text: text.clone(),
            complete: false,
        }) {
            return Ok(Flow::Interrupted);
        }
        if !state.response.is_empty() {
            state.response.push(' ');
        }
        state.response.push_str(&text);

        let mut audio = self
            .synthesizer
            .synthesize(&text)
            .await
            .map_err(as_synthesis)?;
        let mut chunks: Vec<AudioChunk> = Vec::new();
        while let Some(chunk) = audio.next().await {
            if state.interrupt.is_raised() {
                return Ok(Flow::Interrupted);
            }
            let chunk = chunk.map_err(as_synthesis)?;
            if self.config.emit_expression {
                chunks.push(chunk);
            } else if chunk.is_empty() {
                continue;
            } else {
                let audio = codec::encode(&chunk, self.config.audio_format)?;
                if let Flow::Interrupted = state.emit(EventPayload::AudioChunk { audio }) {
                    return Ok(Flow::Interrupted);
                }
            }
        }

        if self.config.emit_expression {
            if let Some(full) = AudioChunk::concat(&chunks).filter(|c| !c.is_empty()) {
                let duration = full.duration_secs();
                let timeline = build_timeline(&markers, text.chars().count(), duration);
                let envelope = self.envelope.sample_chunk(&full);
                let audio = codec::encode(&full, self.config.audio_format)?;
                let payload = EventPayload::AudioExpression {
                    audio,
                    envelope,
                    envelope_fps: self.envelope.fps(),
                    timeline,
                    text: text.clone(),
                };
                if let Flow::Interrupted = state.emit(payload) {
                    return Ok(Flow::Interrupted);
                }
            }
        }

        debug!(turn = state.turn, unit = state.units, chars = text.len(), "unit emitted");
        state.units += 1;
        Ok(Flow::Continue)
    }
}

fn as_synthesis(e: ParleyError) -> ParleyError {
    error!(error = %e, "synthesis failed");
    match e {
        ParleyError::Synthesis(_) => e,
        other => ParleyError::Synthesis(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioFormat;
    use crate::events::{EventBus, EventKind, OutputEvent};
    use crate::providers::stub::{ScriptedGenerator, ToneSynthesizer};
    use crate::providers::{AudioStream, Generator};
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;

    #[test]
    fn accumulator_splits_on_terminators_after_min_chars() {
        let mut acc = SentenceAccumulator::new(8, 240);
        assert!(acc.push("Hi. How").is_empty(), "too short to split at 'Hi.'");
        assert_eq!(acc.push(" are you? I am"), vec!["Hi. How are you?"]);
        assert_eq!(acc.push(" fine.\nOk"), vec!["I am fine."]);
        assert_eq!(acc.flush().as_deref(), Some("Ok"));
        assert_eq!(acc.flush(), None);
    }

    #[test]
    fn accumulator_keeps_decimals_and_marker_intensity() {
        let mut acc = SentenceAccumulator::new(1, 240);
        assert!(acc.push("It costs 3.5 dollars [happy:0.5]").is_empty());
        assert_eq!(acc.push(" today. "), vec!["It costs 3.5 dollars [happy:0.5] today."]);
    }

    #[test]
    fn accumulator_force_splits_long_runs_at_whitespace() {
        let mut acc = SentenceAccumulator::new(1, 10);
        let units = acc.push("aaaa bbbb cccc dddd");
        assert_eq!(units, vec!["aaaa bbbb"]);
        assert_eq!(acc.pending(), " cccc dddd");
        assert_eq!(acc.flush().as_deref(), Some("cccc dddd"));
    }

    #[test]
    fn accumulator_force_split_keeps_markers_whole() {
        let mut acc = SentenceAccumulator::new(1, 16);
        let units = acc.push("onetwothree[happy:0.75]four");
        assert_eq!(units, vec!["onetwothree"]);
        assert_eq!(acc.pending(), "[happy:0.75]four");

        let rest = acc.flush().unwrap();
        let (text, markers) = extract_markers(&rest);
        assert_eq!(text, "four");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].label, "happy");
    }

    fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<OutputEvent>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            bus.subscribe_fn(kind, 0, move |ev| {
                seen.lock().push(ev.clone());
                Ok(())
            });
        }
        (bus, seen)
    }

    fn output(emit_expression: bool) -> OutputPipeline {
        let config = OutputConfig {
            min_sentence_chars: 4,
            emit_expression,
            audio_format: AudioFormat::Pcm16,
            ..OutputConfig::default()
        };
        OutputPipeline::new(Arc::new(ToneSynthesizer::new(16_000)), config)
    }

    async fn script(fragments: Vec<Fragment>) -> FragmentStream {
        ScriptedGenerator::new(fragments).generate("", &[]).await.unwrap()
    }

    #[tokio::test]
    async fn emits_text_then_expression_per_unit_then_terminal() {
        let (bus, seen) = recording_bus();
        let emitter = EventEmitter::new("s", bus);
        let stream = script(vec![
            Fragment::text("[happy]Hello th"),
            Fragment::text("ere. Bye"),
            Fragment::text(" now."),
        ])
        .await;

        let outcome = output(true).run(stream, &InterruptFlag::new(), &emitter, 1).await;
        assert!(matches!(outcome.status, OutputStatus::Completed));
        assert_eq!(outcome.response_text, "Hello there. Bye now.");
        assert_eq!(outcome.units, 2);

        let events = seen.lock();
        let kinds: Vec<EventKind> = events.iter().map(OutputEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TextFragment,
                EventKind::AudioExpression,
                EventKind::TextFragment,
                EventKind::AudioExpression,
                EventKind::TextFragment,
            ]
        );
        assert!(events.last().unwrap().is_complete_marker());
        assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert_eq!(events[0].metadata["turn"], 1);

        let EventPayload::AudioExpression { timeline, text, envelope, .. } = &events[1].payload else {
            panic!("expected expression payload");
        };
        assert_eq!(text, "Hello there.");
        assert_eq!(timeline[0].label, "happy");
        assert!(!envelope.is_empty());
        // The unclosed marker carries into the second unit.
        let EventPayload::AudioExpression { timeline, .. } = &events[3].payload else {
            panic!("expected expression payload");
        };
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].label, "happy");
    }

    #[tokio::test]
    async fn raw_audio_mode_emits_chunks() {
        let (bus, seen) = recording_bus();
        let emitter = EventEmitter::new("s", bus);
        let stream = script(vec![Fragment::text("one two three.")]).await;

        output(false).run(stream, &InterruptFlag::new(), &emitter, 1).await;
        let chunks = seen
            .lock()
            .iter()
            .filter(|e| e.kind() == EventKind::AudioChunk)
            .count();
        assert_eq!(chunks, 3, "one tone chunk per word");
    }

    #[tokio::test]
    async fn control_fragment_flushes_pending_text_first() {
        let (bus, seen) = recording_bus();
        let emitter = EventEmitter::new("s", bus);
        let stream = script(vec![
            Fragment::text("Let me check"),
            Fragment::Control {
                name: "weather".into(),
                arguments: json!({ "city": "Oslo" }),
            },
        ])
        .await;

        output(true).run(stream, &InterruptFlag::new(), &emitter, 1).await;
        let events = seen.lock();
        assert!(matches!(
            &events[0].payload,
            EventPayload::TextFragment { text, .. } if text == "Let me check"
        ));
        assert!(matches!(
            &events[2].payload,
            EventPayload::Control { signal: ControlSignal::Tool { name, .. } } if name == "weather"
        ));
    }

    struct FailingSynth;

    #[async_trait]
    impl Synthesizer for FailingSynth {
        async fn synthesize(&self, _text: &str) -> Result<AudioStream> {
            Ok(Box::pin(stream::iter(vec![Err(ParleyError::Io(
                std::io::Error::other("socket closed"),
            ))])))
        }
    }

    #[tokio::test]
    async fn synthesis_error_fails_the_run_without_terminal_marker() {
        let (bus, seen) = recording_bus();
        let emitter = EventEmitter::new("s", bus);
        let pipeline = OutputPipeline::new(Arc::new(FailingSynth), OutputConfig::default());
        let stream = script(vec![Fragment::text("Hello world.")]).await;

        let outcome = pipeline.run(stream, &InterruptFlag::new(), &emitter, 1).await;
        assert!(matches!(outcome.status, OutputStatus::Failed(ParleyError::Synthesis(_))));
        assert!(!seen.lock().iter().any(OutputEvent::is_complete_marker));
    }

    #[tokio::test]
    async fn raised_interrupt_emits_nothing() {
        let (bus, seen) = recording_bus();
        let emitter = EventEmitter::new("s", bus);
        let stream = script(vec![Fragment::text("Hello world.")]).await;
        let flag = InterruptFlag::new();
        flag.raise();

        let outcome = output(true).run(stream, &flag, &emitter, 1).await;
        assert!(matches!(outcome.status, OutputStatus::Interrupted));
        assert!(seen.lock().is_empty());
        assert_eq!(emitter.emitted(), 0);
    }
}
