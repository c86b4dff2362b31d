//! Durable workflow runs.
//!
//! The dispatcher enqueues one [`WorkflowRun`] per matching rule; a
//! [`RunExecutor`] claims runs from the [`RunStore`], drives them through the
//! graph executor and applies retry/backoff/dead-letter handling to the result.
//! The [`StepJournal`] remembers completed nodes so a retried attempt resumes
//! where the failed one stopped.

pub mod executor;
pub mod journal;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, RunExecutor, RunExecutorConfig, RunExecutorHandle, RunHandler};
pub use journal::{InMemoryStepJournal, StepJournal, StepRecord};
pub use store::{InMemoryRunStore, RunStats, RunStore, RunStoreError};
pub use types::{BackoffStrategy, DeadLetterEntry, RetryPolicy, RunAttemptRecord, RunResult, RunStatus, WorkflowRun};
