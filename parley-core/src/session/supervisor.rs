//! Owner of every live session.
//!
//! The supervisor is the only place holding the session map; callers go
//! through `create`, `get` and `destroy`. All sessions share one `EventBus`
//! and one resolved `Providers` bundle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::ConversationOrchestrator;
use crate::config::EngineConfig;
use crate::error::{ParleyError, Result};
use crate::events::EventBus;
use crate::providers::{ProviderRegistry, Providers};

pub struct SessionSupervisor {
    config: EngineConfig,
    providers: Providers,
    bus: Arc<EventBus>,
    sessions: RwLock<HashMap<String, Arc<ConversationOrchestrator>>>,
}

impl SessionSupervisor {
    /// Resolve providers from `registry` and start with an empty bus.
    pub fn new(config: EngineConfig, registry: &ProviderRegistry) -> Result<Self> {
        let providers = registry.build(&config)?;
        Ok(Self::with_parts(config, providers, Arc::new(EventBus::new())))
    }

    pub fn with_parts(config: EngineConfig, providers: Providers, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            providers,
            bus,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// # Errors
    /// `SessionExists` if `id` is taken.
    pub fn create(&self, id: &str) -> Result<Arc<ConversationOrchestrator>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(id) {
            return Err(ParleyError::SessionExists(id.to_string()));
        }
        let session = Arc::new(ConversationOrchestrator::new(
            id,
            self.config.clone(),
            self.providers.clone(),
            Arc::clone(&self.bus),
        )?);
        sessions.insert(id.to_string(), Arc::clone(&session));
        info!(session = id, live = sessions.len(), "session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ConversationOrchestrator>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ParleyError::SessionNotFound(id.to_string()))
    }

    /// Remove a session, interrupting its active turn if there is one.
    ///
    /// The turn winds down on its own task; holders of the `Arc` keep a
    /// usable (but unregistered) session until they drop it.
    pub fn destroy(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| ParleyError::SessionNotFound(id.to_string()))?;
        match session.interrupt() {
            Ok(true) => info!(session = id, "active turn interrupted on destroy"),
            Ok(false) | Err(ParleyError::NotActive) => {}
            Err(e) => warn!(session = id, error = %e, "interrupt on destroy failed"),
        }
        info!(session = id, "session destroyed");
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::pipeline::PipelineInput;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn supervisor() -> SessionSupervisor {
        SessionSupervisor::new(EngineConfig::default(), &ProviderRegistry::builtin()).unwrap()
    }

    #[test]
    fn create_get_destroy() {
        let sup = supervisor();
        sup.create("b").unwrap();
        sup.create("a").unwrap();
        assert!(matches!(sup.create("a"), Err(ParleyError::SessionExists(_))));
        assert_eq!(sup.session_ids(), vec!["a", "b"]);
        assert_eq!(sup.get("a").unwrap().session_id(), "a");

        sup.destroy("a").unwrap();
        assert!(matches!(sup.get("a"), Err(ParleyError::SessionNotFound(_))));
        assert!(matches!(sup.destroy("a"), Err(ParleyError::SessionNotFound(_))));
        assert_eq!(sup.len(), 1);
    }

    #[test]
    fn unknown_provider_fails_construction() {
        let mut config = EngineConfig::default();
        config.providers.generator = "missing".into();
        assert!(matches!(
            SessionSupervisor::new(config, &ProviderRegistry::builtin()),
            Err(ParleyError::UnknownProvider { kind: "generator", .. })
        ));
    }

    #[tokio::test]
    async fn sessions_share_the_bus_with_independent_sequences() {
        let sup = supervisor();
        let last_seq: Arc<parking_lot::Mutex<HashMap<String, u64>>> = Default::default();
        let violations = Arc::new(AtomicU64::new(0));
        for kind in EventKind::ALL {
            let last_seq = Arc::clone(&last_seq);
            let violations = Arc::clone(&violations);
            sup.bus().subscribe_fn(kind, 0, move |ev| {
                let mut map = last_seq.lock();
                let expected = map.get(&ev.session_id).map_or(0, |s| s + 1);
                if ev.seq != expected {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                map.insert(ev.session_id.clone(), ev.seq);
                Ok(())
            });
        }

        let a = sup.create("a").unwrap();
        let b = sup.create("b").unwrap();
        let (ra, rb) = tokio::join!(
            a.submit(PipelineInput::Text("one".into())),
            b.submit(PipelineInput::Text("two".into())),
        );
        assert!(ra.unwrap().success && rb.unwrap().success);
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(last_seq.lock().len(), 2);
        // turn-start, text, audio, terminal marker, turn-end at least.
        assert!(a.emitter().emitted() >= 5 && b.emitter().emitted() >= 5);
    }
}
