//! Priority-ordered, failure-isolated publish/subscribe hub.
//!
//! Subscribers register per `EventKind` with an integer priority. `emit`
//! delivers to every current subscriber of the event's kind in descending
//! priority, ties broken by subscription order. A consumer that returns an
//! error or panics is logged and skipped; it never stops delivery to the
//! others and never propagates to the emitter.
//!
//! The table is shared across sessions behind a `parking_lot::RwLock`. `emit`
//! snapshots the matching subscribers and releases the lock before calling
//! any consumer, so consumers may subscribe or unsubscribe from inside a
//! callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EventKind, OutputEvent};

/// Receives events from the bus.
///
/// Called synchronously on the emitting task; long work should be handed
/// off (see `ChannelConsumer`).
pub trait EventConsumer: Send + Sync + 'static {
    fn on_event(&self, event: &OutputEvent) -> anyhow::Result<()>;
}

/// Adapter turning a closure into a consumer.
pub struct FnConsumer<F>(pub F);

impl<F> EventConsumer for FnConsumer<F>
where
    F: Fn(&OutputEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &OutputEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Forwards events into a bounded tokio channel for async consumers.
///
/// Uses `try_send`: a full or closed channel is reported as a delivery
/// failure instead of blocking the emitting pipeline.
pub struct ChannelConsumer {
    tx: mpsc::Sender<OutputEvent>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<OutputEvent>) -> Self {
        Self { tx }
    }
}

impl EventConsumer for ChannelConsumer {
    fn on_event(&self, event: &OutputEvent) -> anyhow::Result<()> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("channel full, event dropped"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("channel closed"),
        })
    }
}

/// Revocable handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Outcome of one `emit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct Entry {
    id: u64,
    priority: i32,
    consumer: Arc<dyn EventConsumer>,
}

#[derive(Default)]
pub struct EventBus {
    table: RwLock<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
    failures: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for events of `kind`. Higher `priority` runs first.
    pub fn subscribe(
        &self,
        kind: EventKind,
        consumer: Arc<dyn EventConsumer>,
        priority: i32,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.write();
        let entries = table.entry(kind).or_default();
        // Insert after every entry with priority >= ours: stable for ties.
        let at = entries.partition_point(|e| e.priority >= priority);
        entries.insert(
            at,
            Entry {
                id,
                priority,
                consumer,
            },
        );
        debug!(subscription = id, ?kind, priority, "subscribed");
        Subscription { id, kind }
    }

    /// Convenience for closure consumers.
    pub fn subscribe_fn<F>(&self, kind: EventKind, priority: i32, f: F) -> Subscription
    where
        F: Fn(&OutputEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(FnConsumer(f)), priority)
    }

    /// Subscribe one bounded channel to several kinds at once.
    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
        priority: i32,
        capacity: usize,
    ) -> (Vec<Subscription>, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer: Arc<dyn EventConsumer> = Arc::new(ChannelConsumer::new(tx));
        let subs = kinds
            .iter()
            .map(|kind| self.subscribe(*kind, Arc::clone(&consumer), priority))
            .collect();
        (subs, rx)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut table = self.table.write();
        let Some(entries) = table.get_mut(&subscription.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != subscription.id);
        let removed = entries.len() != before;
        if removed {
            debug!(subscription = subscription.id, "unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every current subscriber of its kind.
    pub fn emit(&self, event: &OutputEvent) -> DispatchReport {
        let targets: Vec<(u64, Arc<dyn EventConsumer>)> = {
            let table = self.table.read();
            match table.get(&event.kind()) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id, Arc::clone(&e.consumer)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut report = DispatchReport::default();
        for (id, consumer) in targets {
            match catch_unwind(AssertUnwindSafe(|| consumer.on_event(event))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        subscription = id,
                        session = %event.session_id,
                        seq = event.seq,
                        error = %e,
                        "subscriber failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        subscription = id,
                        session = %event.session_id,
                        seq = event.seq,
                        "subscriber panicked"
                    );
                }
            }
        }
        if report.failed > 0 {
            self.failures.fetch_add(report.failed, Ordering::Relaxed);
        }
        report
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.table.read().get(&kind).map_or(0, Vec::len)
    }

    /// Total failed deliveries since creation.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ControlSignal, EventPayload, Metadata};
    use chrono::Utc;
    use parking_lot::Mutex;

    fn event(seq: u64, payload: EventPayload) -> OutputEvent {
        OutputEvent {
            session_id: "s".into(),
            seq,
            payload,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    fn text(seq: u64) -> OutputEvent {
        event(
            seq,
            EventPayload::TextFragment {
                text: format!("t{seq}"),
                complete: false,
            },
        )
    }

    fn recorder(bus: &EventBus, log: &Arc<Mutex<Vec<String>>>, tag: &str, priority: i32) -> Subscription {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        bus.subscribe_fn(EventKind::TextFragment, priority, move |ev| {
            log.lock().push(format!("{tag}:{}", ev.seq));
            Ok(())
        })
    }

    #[test]
    fn delivers_by_priority_then_insertion() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "low", 0);
        recorder(&bus, &log, "high-a", 10);
        recorder(&bus, &log, "mid", 5);
        recorder(&bus, &log, "high-b", 10);

        let report = bus.emit(&text(1));
        assert_eq!(report, DispatchReport { delivered: 4, failed: 0 });
        assert_eq!(
            *log.lock(),
            vec!["high-a:1", "high-b:1", "mid:1", "low:1"]
        );
    }

    #[test]
    fn only_matching_kind_is_delivered() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, &log, "text", 0);
        let report = bus.emit(&event(
            1,
            EventPayload::Control {
                signal: ControlSignal::TurnEnd,
            },
        ));
        assert_eq!(report.delivered, 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_fn(EventKind::TextFragment, 100, |_| Err(anyhow!("always fails")));
        bus.subscribe_fn(EventKind::TextFragment, 50, |_| panic!("consumer bug"));
        recorder(&bus, &log, "ok", 0);

        for seq in 0..3 {
            let report = bus.emit(&text(seq));
            assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        }
        assert_eq!(*log.lock(), vec!["ok:0", "ok:1", "ok:2"]);
        assert_eq!(bus.failures(), 6);
    }

    #[test]
    fn unsubscribe_revokes_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = recorder(&bus, &log, "a", 0);
        recorder(&bus, &log, "b", 0);

        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        bus.emit(&text(7));
        assert_eq!(*log.lock(), vec!["b:7"]);
        assert_eq!(bus.subscriber_count(EventKind::TextFragment), 1);
    }

    #[test]
    fn consumer_may_unsubscribe_itself_during_emit() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = {
            let inner_bus = Arc::clone(&bus);
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            bus.subscribe_fn(EventKind::TextFragment, 0, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().take() {
                    inner_bus.unsubscribe(sub);
                }
                Ok(())
            })
        };
        *slot.lock() = Some(sub);

        bus.emit(&text(1));
        bus.emit(&text(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_consumer_forwards_and_reports_full() {
        let bus = EventBus::new();
        let (subs, mut rx) = bus.subscribe_channel(&[EventKind::TextFragment, EventKind::Control], 0, 2);
        assert_eq!(subs.len(), 2);

        assert_eq!(bus.emit(&text(1)).delivered, 1);
        assert_eq!(
            bus.emit(&event(
                2,
                EventPayload::Control {
                    signal: ControlSignal::TurnEnd
                }
            ))
            .delivered,
            1
        );
        // Capacity 2 reached.
        assert_eq!(bus.emit(&text(3)).failed, 1);

        assert_eq!(rx.recv().await.map(|e| e.seq), Some(1));
        assert_eq!(rx.recv().await.map(|e| e.seq), Some(2));
    }
}
