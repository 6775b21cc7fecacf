//! Key → factory lookup for capability providers.
//!
//! The registry is an ordinary value: build it (usually from `builtin()`),
//! register any extra factories, then resolve a `ProviderSelection`. Nothing
//! registers itself implicitly.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::stub::{EchoGenerator, StubTranscriber, ToneSynthesizer};
use super::{Generator, Synthesizer, Transcriber};
use crate::config::EngineConfig;
use crate::error::{ParleyError, Result};
use crate::vad::{EnergyScorer, SpeechScorer};

pub type TranscriberFactory =
    Arc<dyn Fn(&EngineConfig) -> Result<Arc<dyn Transcriber>> + Send + Sync>;
pub type GeneratorFactory = Arc<dyn Fn(&EngineConfig) -> Result<Arc<dyn Generator>> + Send + Sync>;
pub type SynthesizerFactory =
    Arc<dyn Fn(&EngineConfig) -> Result<Arc<dyn Synthesizer>> + Send + Sync>;
/// Scorers are stateful, so every session gets its own instance.
pub type ScorerFactory = Arc<dyn Fn(&EngineConfig) -> Result<Box<dyn SpeechScorer>> + Send + Sync>;

/// Resolved providers for a set of sessions.
///
/// Transcriber, generator and synthesizer are shared; the scorer factory is
/// invoked once per session.
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub scorer: ScorerFactory,
}

impl Providers {
    pub fn new_scorer(&self, config: &EngineConfig) -> Result<Box<dyn SpeechScorer>> {
        (self.scorer)(config)
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    transcribers: HashMap<String, TranscriberFactory>,
    generators: HashMap<String, GeneratorFactory>,
    synthesizers: HashMap<String, SynthesizerFactory>,
    scorers: HashMap<String, ScorerFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the in-crate providers:
    /// `stub` transcriber, `echo` generator, `tone` synthesizer, `energy` scorer.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_transcriber("stub", |_| Ok(Arc::new(StubTranscriber::new())));
        registry.register_generator("echo", |_| Ok(Arc::new(EchoGenerator::new())));
        registry.register_synthesizer("tone", |cfg| {
            Ok(Arc::new(ToneSynthesizer::new(cfg.gate.sample_rate)))
        });
        registry.register_scorer("energy", |_| Ok(Box::new(EnergyScorer::default())));
        registry
    }

    pub fn register_transcriber<F>(&mut self, key: &str, factory: F) -> &mut Self
    where
        F: Fn(&EngineConfig) -> Result<Arc<dyn Transcriber>> + Send + Sync + 'static,
    {
        self.transcribers.insert(normalize_key(key), Arc::new(factory));
        self
    }

    pub fn register_generator<F>(&mut self, key: &str, factory: F) -> &mut Self
    where
        F: Fn(&EngineConfig) -> Result<Arc<dyn Generator>> + Send + Sync + 'static,
    {
        self.generators.insert(normalize_key(key), Arc::new(factory));
        self
    }

    pub fn register_synthesizer<F>(&mut self, key: &str, factory: F) -> &mut Self
    where
        F: Fn(&EngineConfig) -> Result<Arc<dyn Synthesizer>> + Send + Sync + 'static,
    {
        self.synthesizers.insert(normalize_key(key), Arc::new(factory));
        self
    }

    pub fn register_scorer<F>(&mut self, key: &str, factory: F) -> &mut Self
    where
        F: Fn(&EngineConfig) -> Result<Box<dyn SpeechScorer>> + Send + Sync + 'static,
    {
        self.scorers.insert(normalize_key(key), Arc::new(factory));
        self
    }

    /// Resolve every provider named in `config.providers`.
    ///
    /// # Errors
    /// `UnknownProvider` for the first key with no registered factory, or any
    /// error the factory itself returns.
    pub fn build(&self, config: &EngineConfig) -> Result<Providers> {
        let sel = &config.providers;
        let transcriber = lookup(&self.transcribers, "transcriber", &sel.transcriber)?(config)?;
        let generator = lookup(&self.generators, "generator", &sel.generator)?(config)?;
        let synthesizer = lookup(&self.synthesizers, "synthesizer", &sel.synthesizer)?(config)?;
        let scorer = Arc::clone(lookup(&self.scorers, "scorer", &sel.scorer)?);
        info!(
            transcriber = %sel.transcriber,
            generator = %sel.generator,
            synthesizer = %sel.synthesizer,
            scorer = %sel.scorer,
            "providers resolved"
        );
        Ok(Providers {
            transcriber,
            generator,
            synthesizer,
            scorer,
        })
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

fn lookup<'a, T>(
    table: &'a HashMap<String, T>,
    kind: &'static str,
    key: &str,
) -> Result<&'a T> {
    table
        .get(&normalize_key(key))
        .ok_or_else(|| ParleyError::UnknownProvider {
            kind,
            key: key.to_string(),
        })
}
