//! Run one session end-to-end and print every event as a JSON line.
//!
//! ```text
//! turn_sim [--config engine.json] [--wav speech.wav | --text "hello"] [--session id]
//! ```
//!
//! Without `--wav` or `--text`, a synthetic utterance (tone burst between
//! silences) is fed through the gate. Logs go to stderr (`RUST_LOG`,
//! default `info`); events go to stdout.

use std::f32::consts::TAU;
use std::path::PathBuf;

use anyhow::{bail, Context};
use parley_core::buffering::AudioFrame;
use parley_core::codec::read_wav_file;
use parley_core::config::GateConfig;
use parley_core::{EngineConfig, EventKind, PipelineInput, ProviderRegistry, SessionSupervisor};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    wav: Option<PathBuf>,
    text: Option<String>,
    session: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--wav" => args.wav = Some(PathBuf::from(value("--wav")?)),
            "--text" => args.text = Some(value("--text")?),
            "--session" => args.session = Some(value("--session")?),
            "-h" | "--help" => {
                println!("usage: turn_sim [--config FILE] [--wav FILE | --text TEXT] [--session ID]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    if args.wav.is_some() && args.text.is_some() {
        bail!("--wav and --text are exclusive");
    }
    Ok(args)
}

/// 0.4 s silence, 1.2 s tone burst, 0.8 s silence.
fn synthetic_utterance(gate: &GateConfig) -> Vec<f32> {
    let rate = gate.sample_rate as usize;
    let mut samples = vec![0.0; rate * 2 / 5];
    let burst = rate * 6 / 5;
    samples.extend((0..burst).map(|n| {
        let t = n as f32 / rate as f32;
        0.3 * (TAU * 180.0 * t).sin() * (1.0 + 0.3 * (TAU * 3.0 * t).sin())
    }));
    samples.extend(std::iter::repeat(0.0).take(rate * 4 / 5));
    samples
}

fn into_frames(samples: &[f32], gate: &GateConfig) -> Vec<AudioFrame> {
    let frame_len = gate.frame_len();
    samples
        .chunks(frame_len)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = chunk.to_vec();
            frame.resize(frame_len, 0.0);
            AudioFrame::new(frame, gate.sample_rate, i as u64)
        })
        .collect()
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };

    let supervisor = SessionSupervisor::new(config.clone(), &ProviderRegistry::builtin())?;
    let bus = supervisor.bus();
    let (subscriptions, mut rx) = bus.subscribe_channel(&EventKind::ALL, 0, 1_024);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(seq = event.seq, error = %e, "event not serializable"),
            }
        }
    });

    let session_id = args.session.as_deref().unwrap_or("sim");
    let session = supervisor.create(session_id)?;

    let results = if let Some(text) = args.text {
        vec![session.submit(PipelineInput::Text(text)).await?]
    } else {
        let samples = match &args.wav {
            Some(path) => {
                let chunk = read_wav_file(path)?;
                if chunk.sample_rate != config.gate.sample_rate {
                    bail!(
                        "{} is {} Hz, gate expects {} Hz",
                        path.display(),
                        chunk.sample_rate,
                        config.gate.sample_rate
                    );
                }
                chunk.samples
            }
            None => synthetic_utterance(&config.gate),
        };
        let frames = into_frames(&samples, &config.gate);
        tracing::info!(frames = frames.len(), "feeding audio");
        session.run_audio(futures::stream::iter(frames)).await
    };

    for result in &results {
        tracing::info!(
            turn = result.turn,
            success = result.success,
            interrupted = result.interrupted,
            transcript = %result.transcript,
            response = %result.response_text,
            "turn result"
        );
    }
    let diagnostics = serde_json::to_string(&session.diagnostics())?;
    eprintln!("{diagnostics}");

    supervisor.destroy(session_id)?;
    for sub in subscriptions {
        bus.unsubscribe(sub);
    }
    printer.await.context("event printer task")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("turn_sim failed: {e:#}");
        std::process::exit(1);
    }
}
