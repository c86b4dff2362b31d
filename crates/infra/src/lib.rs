//! Storage, handlers and the execution engine.
//!
//! Everything that performs IO lives here: the inventory ledger and
//! allocation-result store, the rule store, the inventory action handlers,
//! the trigger processor, the durable run backend and the graph executor.
//! Each store has an in-memory implementation for tests and single-process
//! use and a Postgres implementation behind the same trait.

pub mod authoring;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod ledger;
pub mod references;
pub mod rules;
pub mod runs;
pub mod sweeper;
pub mod trigger_processor;
pub mod workflow;

#[cfg(test)]
mod integration_tests;

pub use authoring::{AuthoringError, RuleService};
pub use config::{EngineConfig, EngineConfigError};
pub use engine::{Engine, EngineHandles, EngineStores};
pub use handlers::{InventoryServices, register_inventory_handlers};
pub use sweeper::{ReservationSweeper, SweepReport};
pub use trigger_processor::TriggerProcessor;
pub use workflow::{DispatchError, DispatchReport, ExecutionError, GraphExecutor, RunSummary, WorkflowDispatcher};
