//! Per-execution record of completed graph nodes.
//!
//! A retried run replays journaled nodes instead of executing them again, so
//! branch decisions taken by an earlier attempt stay fixed even if the data a
//! check read has changed since.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_automation::{ActionOutcome, EdgeType};
use stockflow_core::{ActionId, ExecutionId};

use super::store::RunStoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub action_id: ActionId,
    pub action_type: String,
    pub outcome: ActionOutcome,
    /// Edge chosen after the node.
    pub edge: EdgeType,
    pub completed_at: DateTime<Utc>,
}

pub trait StepJournal: Send + Sync {
    fn record(&self, execution_id: ExecutionId, step: StepRecord) -> Result<(), RunStoreError>;

    fn steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>, RunStoreError>;

    /// Forget an execution once its run is finished.
    fn clear(&self, execution_id: ExecutionId) -> Result<(), RunStoreError>;
}

impl<J> StepJournal for Arc<J>
where
    J: StepJournal + ?Sized,
{
    fn record(&self, execution_id: ExecutionId, step: StepRecord) -> Result<(), RunStoreError> {
        (**self).record(execution_id, step)
    }

    fn steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>, RunStoreError> {
        (**self).steps(execution_id)
    }

    fn clear(&self, execution_id: ExecutionId) -> Result<(), RunStoreError> {
        (**self).clear(execution_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStepJournal {
    steps: RwLock<HashMap<ExecutionId, Vec<StepRecord>>>,
}

impl InMemoryStepJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RunStoreError {
    RunStoreError::Storage("step journal lock poisoned".into())
}

impl StepJournal for InMemoryStepJournal {
    fn record(&self, execution_id: ExecutionId, step: StepRecord) -> Result<(), RunStoreError> {
        let mut steps = self.steps.write().map_err(|_| poisoned())?;
        let entries = steps.entry(execution_id).or_default();
        // First record for a node wins.
        if !entries.iter().any(|s| s.action_id == step.action_id) {
            entries.push(step);
        }
        Ok(())
    }

    fn steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>, RunStoreError> {
        let steps = self.steps.read().map_err(|_| poisoned())?;
        Ok(steps.get(&execution_id).cloned().unwrap_or_default())
    }

    fn clear(&self, execution_id: ExecutionId) -> Result<(), RunStoreError> {
        self.steps.write().map_err(|_| poisoned())?.remove(&execution_id);
        Ok(())
    }
}
