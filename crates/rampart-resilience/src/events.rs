//! ---
//! rampart_section: "07-resilience-fault-tolerance"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Uniform event surface shared by every resilience component."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Every component publishes the same event envelope through an [`EventBus`].
//! Handlers run synchronously in subscription order; a handler that errors or
//! panics is logged and skipped so delivery to the others continues.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Fixed enumeration of event types published by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
    RecoveryStarted,
    RecoverySucceeded,
    RecoveryFailed,
    EscalationTriggered,
    DegradationActivated,
    DegradationRecovered,
    HealthDegraded,
    HealthRecovered,
    ChaosExperimentStarted,
    ChaosExperimentCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CircuitOpened => "circuit-opened",
            EventKind::CircuitClosed => "circuit-closed",
            EventKind::CircuitHalfOpen => "circuit-half-open",
            EventKind::RecoveryStarted => "recovery-started",
            EventKind::RecoverySucceeded => "recovery-succeeded",
            EventKind::RecoveryFailed => "recovery-failed",
            EventKind::EscalationTriggered => "escalation-triggered",
            EventKind::DegradationActivated => "degradation-activated",
            EventKind::DegradationRecovered => "degradation-recovered",
            EventKind::HealthDegraded => "health-degraded",
            EventKind::HealthRecovered => "health-recovered",
            EventKind::ChaosExperimentStarted => "chaos-experiment-started",
            EventKind::ChaosExperimentCompleted => "chaos-experiment-completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Breaker name, component name, failure component or experiment target.
    pub component: String,
    pub data: serde_json::Value,
}

impl ResilienceEvent {
    pub fn new(kind: EventKind, component: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            component: component.into(),
            data,
        }
    }
}

type Handler = Arc<dyn Fn(&ResilienceEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, Handler)>>,
}

/// Cloneable handle to a list of subscriber closures.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Keep the returned [`Subscription`] to detach it later.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ResilienceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push((id, Arc::new(handler)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every handler, isolating failures per handler.
    pub fn emit(&self, event: ResilienceEvent) {
        // Snapshot so handlers may subscribe or unsubscribe while being called.
        let handlers: Vec<(u64, Handler)> = self.inner.handlers.read().clone();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    target: "rampart::resilience::events",
                    handler = id,
                    event = %event.kind,
                    error = %err,
                    "event handler failed"
                ),
                Err(_) => error!(
                    target: "rampart::resilience::events",
                    handler = id,
                    event = %event.kind,
                    "event handler panicked"
                ),
            }
        }
    }

    /// Number of attached handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::on_event`].
///
/// Dropping it keeps the handler attached; call [`Subscription::unsubscribe`] to detach.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: std::sync::Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.handlers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn faulty_handlers_do_not_block_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.on_event(|_| Err(anyhow::anyhow!("subscriber bug")));
        bus.on_event(|_| panic!("subscriber panic"));
        let sink = seen.clone();
        bus.on_event(move |event| {
            sink.lock().push(event.kind);
            Ok(())
        });

        bus.emit(ResilienceEvent::new(
            EventKind::CircuitOpened,
            "db",
            serde_json::json!({}),
        ));
        assert_eq!(*seen.lock(), vec![EventKind::CircuitOpened]);
    }

    #[test]
    fn unsubscribe_detaches_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let subscription = bus.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let event = ResilienceEvent::new(EventKind::HealthDegraded, "api", serde_json::Value::Null);
        bus.emit(event.clone());
        subscription.unsubscribe();
        bus.emit(event);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn event_type_serialises_kebab_case() {
        let event = ResilienceEvent::new(
            EventKind::ChaosExperimentStarted,
            "checkout",
            serde_json::json!({"id": "x"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chaos-experiment-started");
        assert_eq!(json["component"], "checkout");
    }
}
