//! From trigger event to executed action graph.
//!
//! [`WorkflowDispatcher`] turns a matched event into durable runs;
//! [`GraphExecutor`] executes one run by walking its rule's action graph.

pub mod dispatcher;
pub mod executor;

pub use dispatcher::{ConsumerHandle, DispatchError, DispatchReport, WorkflowDispatcher};
pub use executor::{ExecutionError, GraphExecutor, RunSummary, StepStatus, StepSummary};
