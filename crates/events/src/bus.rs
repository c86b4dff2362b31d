//! Out-of-band delivery of trigger events.
//!
//! The delegate calls listeners inline. To run automation on its own thread,
//! register a [`BusForwarder`](crate::BusForwarder) with the delegate and let
//! the dispatcher drain a [`Subscription`].
//!
//! Delivery is at-least-once and unordered across publishers; rule runs are
//! keyed by execution id, so a duplicate event only costs a duplicate run.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::trigger::TriggerEvent;

/// One consumer's view of the bus: every event published after it was
/// created, in publish order. Meant for a single draining thread.
#[derive(Debug)]
pub struct Subscription {
    events: Receiver<TriggerEvent>,
}

impl Subscription {
    pub fn new(events: Receiver<TriggerEvent>) -> Self {
        Self { events }
    }

    /// Wait up to `timeout`; `Disconnected` means the bus is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<TriggerEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }
}

pub trait EventBus: Send + Sync {
    type Error: core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, event: TriggerEvent) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, event: TriggerEvent) -> Result<(), Self::Error> {
        (**self).publish(event)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }
}
