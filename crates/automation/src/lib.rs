//! Rule-driven automation model (pure).
//!
//! - **Rules** bind an entity + trigger type (+ optional conditions) to an
//!   action graph.
//! - **Snapshots** hold the active rules and match events without IO.
//! - **Action graphs** are loaded once per execution into an index-based
//!   adjacency structure and walked one node at a time.
//! - **Handlers** implement a common contract and are looked up by action type
//!   through a registry; each action type has its own validated config schema.
//!
//! Storage, transactions and the durable run backend live in `stockflow-infra`.

pub mod condition;
pub mod config;
pub mod graph;
pub mod handler;
pub mod idempotency;
pub mod matcher;
pub mod rule;

pub use condition::{ConditionOperator, FieldCondition, TriggerConditions};
pub use config::{
    ActionConfig, CheckInventoryConfig, CheckReorderPointConfig, ConfigError,
    ReceiveInventoryConfig, ReserveInventoryConfig, StockMoveConfig, MAX_RESERVATION_HOURS,
};
pub use graph::{ActionGraph, GraphError};
pub use handler::{
    ActionError, ActionHandler, ActionOutcome, EntityModification, ExecutionContext,
    HandlerDescriptor, HandlerRegistry, OutputPort,
};
pub use idempotency::IdempotencyKey;
pub use matcher::RuleSnapshot;
pub use rule::{ActionEdge, ActionTemplate, AutomationRule, EdgeType, RuleAction};
