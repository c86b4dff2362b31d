//! Post-commit notification of entity changes.
//!
//! The business layer calls [`Delegate::notify`] once its mutation has
//! committed. Listener failures are logged and reported as
//! [`Outcome::LoggedFailure`]; they never reach the caller as an error, so the
//! mutation that produced the event always succeeds.

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::trigger::TriggerEvent;

/// Result of a fail-open step: either it worked, or the failure was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T = ()> {
    Success(T),
    LoggedFailure(String),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            Outcome::LoggedFailure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::LoggedFailure(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Something interested in entity changes (e.g. the workflow dispatcher).
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &TriggerEvent) -> Result<(), ListenerError>;
}

impl<L> EventListener for Arc<L>
where
    L: EventListener + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_event(&self, event: &TriggerEvent) -> Result<(), ListenerError> {
        (**self).on_event(event)
    }
}

struct FnListener<F> {
    name: String,
    f: F,
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&TriggerEvent) -> Result<(), ListenerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &TriggerEvent) -> Result<(), ListenerError> {
        (self.f)(event)
    }
}

/// Per-listener record of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOutcome {
    pub listener: String,
    pub outcome: Outcome,
}

/// Fans a committed entity change out to registered listeners.
#[derive(Default)]
pub struct Delegate {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl Delegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&TriggerEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnListener {
            name: name.into(),
            f,
        }));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Notify every listener in registration order.
    pub fn notify(&self, event: &TriggerEvent) -> Vec<ListenerOutcome> {
        // Snapshot so listeners may register others without deadlocking.
        let listeners: Vec<Arc<dyn EventListener>> = match self.listeners.read() {
            Ok(l) => l.clone(),
            Err(_) => {
                warn!("delegate listener registry poisoned; dropping notification");
                return Vec::new();
            }
        };

        listeners
            .iter()
            .map(|listener| {
                let outcome = match listener.on_event(event) {
                    Ok(()) => {
                        debug!(
                            listener = listener.name(),
                            entity = event.entity_name(),
                            event_type = %event.event_type(),
                            "delegate listener notified"
                        );
                        Outcome::Success(())
                    }
                    Err(err) => {
                        warn!(
                            listener = listener.name(),
                            entity = event.entity_name(),
                            entity_id = %event.entity_id(),
                            event_type = %event.event_type(),
                            error = %err,
                            "delegate listener failed"
                        );
                        Outcome::LoggedFailure(err.to_string())
                    }
                };
                ListenerOutcome {
                    listener: listener.name().to_string(),
                    outcome,
                }
            })
            .collect()
    }
}

/// Listener that republishes every event onto an [`EventBus`].
pub struct BusForwarder<B> {
    bus: B,
}

impl<B> BusForwarder<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> EventListener for BusForwarder<B>
where
    B: EventBus,
{
    fn name(&self) -> &str {
        "bus_forwarder"
    }

    fn on_event(&self, event: &TriggerEvent) -> Result<(), ListenerError> {
        self.bus
            .publish(event.clone())
            .map_err(|e| ListenerError::new(format!("publish failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryEventBus;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stockflow_core::{EntityId, UserId};

    fn event() -> TriggerEvent {
        TriggerEvent::created("orders", EntityId::new(), Map::new(), UserId::new())
    }

    #[test]
    fn failing_listener_does_not_stop_later_listeners() {
        let delegate = Delegate::new();
        let calls = Arc::new(AtomicUsize::new(0));

        delegate.register_fn("broken", |_| Err(ListenerError::new("boom")));
        let counter = calls.clone();
        delegate.register_fn("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcomes = delegate.notify(&event());

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].outcome, Outcome::LoggedFailure("boom".into()));
        assert!(outcomes[1].outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forwarder_publishes_to_bus() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let delegate = Delegate::new();
        delegate.register(Arc::new(BusForwarder::new(bus.clone())));

        let ev = event();
        delegate.notify(&ev);

        assert_eq!(sub.recv_timeout(std::time::Duration::from_secs(1)).unwrap(), ev);
    }
}
