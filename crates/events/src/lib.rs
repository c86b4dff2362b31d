//! Entity-change events and their delivery to automation.
//!
//! A business mutation produces exactly one [`TriggerEvent`] after it commits.
//! The [`Delegate`] hands that event to every registered listener and records,
//! rather than propagates, listener failures.

pub mod bus;
pub mod delegate;
pub mod in_memory_bus;
pub mod trigger;

pub use bus::{EventBus, Subscription};
pub use delegate::{BusForwarder, Delegate, EventListener, ListenerError, ListenerOutcome, Outcome};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use trigger::{FieldChange, TriggerEvent, TriggerType};
