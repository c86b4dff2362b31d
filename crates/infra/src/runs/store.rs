//! Run storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use stockflow_core::{RuleId, RunId};

use super::types::{DeadLetterEntry, RunStatus, WorkflowRun};

/// Durable run backend.
pub trait RunStore: Send + Sync {
    fn enqueue(&self, run: WorkflowRun) -> Result<RunId, RunStoreError>;

    fn get(&self, run_id: RunId) -> Result<Option<WorkflowRun>, RunStoreError>;

    fn update(&self, run: &WorkflowRun) -> Result<(), RunStoreError>;

    /// Claim the oldest claimable run and mark it running under `lease`.
    ///
    /// A running run whose lease has expired is claimable again; that is how
    /// an attempt that hung or whose worker died gets retried.
    fn claim_next(&self, lease: Duration) -> Result<Option<WorkflowRun>, RunStoreError>;

    fn list_by_status(&self, status: Option<&RunStatus>, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError>;

    fn list_for_rule(&self, rule_id: RuleId, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError>;

    fn dead_letter(&self, run: WorkflowRun, reason: String) -> Result<(), RunStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, RunStoreError>;

    /// Move a dead-lettered run back to pending with a fresh attempt budget.
    /// The execution id is kept, so completed side effects are not repeated.
    fn retry_dead_letter(&self, run_id: RunId) -> Result<WorkflowRun, RunStoreError>;

    fn delete_dead_letter(&self, run_id: RunId) -> Result<(), RunStoreError>;

    fn stats(&self) -> Result<RunStats, RunStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunStoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),
    /// The backend cannot be reached at all.
    #[error("run backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

impl<S> RunStore for Arc<S>
where
    S: RunStore + ?Sized,
{
    fn enqueue(&self, run: WorkflowRun) -> Result<RunId, RunStoreError> {
        (**self).enqueue(run)
    }

    fn get(&self, run_id: RunId) -> Result<Option<WorkflowRun>, RunStoreError> {
        (**self).get(run_id)
    }

    fn update(&self, run: &WorkflowRun) -> Result<(), RunStoreError> {
        (**self).update(run)
    }

    fn claim_next(&self, lease: Duration) -> Result<Option<WorkflowRun>, RunStoreError> {
        (**self).claim_next(lease)
    }

    fn list_by_status(&self, status: Option<&RunStatus>, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn list_for_rule(&self, rule_id: RuleId, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError> {
        (**self).list_for_rule(rule_id, limit)
    }

    fn dead_letter(&self, run: WorkflowRun, reason: String) -> Result<(), RunStoreError> {
        (**self).dead_letter(run, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, RunStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, run_id: RunId) -> Result<WorkflowRun, RunStoreError> {
        (**self).retry_dead_letter(run_id)
    }

    fn delete_dead_letter(&self, run_id: RunId) -> Result<(), RunStoreError> {
        (**self).delete_dead_letter(run_id)
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        (**self).stats()
    }
}

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, WorkflowRun>>,
    dead_letters: RwLock<HashMap<RunId, DeadLetterEntry>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn runs(&self) -> Result<RwLockReadGuard<'_, HashMap<RunId, WorkflowRun>>, RunStoreError> {
        self.runs.read().map_err(|_| poisoned())
    }

    fn runs_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<RunId, WorkflowRun>>, RunStoreError> {
        self.runs.write().map_err(|_| poisoned())
    }

    fn dead_letters(&self) -> Result<RwLockReadGuard<'_, HashMap<RunId, DeadLetterEntry>>, RunStoreError> {
        self.dead_letters.read().map_err(|_| poisoned())
    }

    fn dead_letters_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<RunId, DeadLetterEntry>>, RunStoreError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> RunStoreError {
    RunStoreError::Storage("run store lock poisoned".into())
}

impl RunStore for InMemoryRunStore {
    fn enqueue(&self, run: WorkflowRun) -> Result<RunId, RunStoreError> {
        let mut runs = self.runs_mut()?;
        if runs.contains_key(&run.id) {
            return Err(RunStoreError::AlreadyExists(run.id));
        }
        let id = run.id;
        runs.insert(id, run);
        Ok(id)
    }

    fn get(&self, run_id: RunId) -> Result<Option<WorkflowRun>, RunStoreError> {
        Ok(self.runs()?.get(&run_id).cloned())
    }

    fn update(&self, run: &WorkflowRun) -> Result<(), RunStoreError> {
        let mut runs = self.runs_mut()?;
        match runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(RunStoreError::NotFound(run.id)),
        }
    }

    fn claim_next(&self, lease: Duration) -> Result<Option<WorkflowRun>, RunStoreError> {
        let mut runs = self.runs_mut()?;
        let now = Utc::now();

        let next = runs
            .values()
            .filter(|r| r.is_claimable(now))
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id);

        Ok(next.and_then(|id| runs.get_mut(&id)).map(|run| {
            run.mark_running(lease);
            run.clone()
        }))
    }

    fn list_by_status(&self, status: Option<&RunStatus>, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError> {
        let runs = self.runs()?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| status.is_none_or(|s| std::mem::discriminant(&r.status) == std::mem::discriminant(s)))
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.created_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn list_for_rule(&self, rule_id: RuleId, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError> {
        let runs = self.runs()?;
        let mut result: Vec<_> = runs.values().filter(|r| r.rule_id == rule_id).cloned().collect();

        result.sort_by_key(|r| (r.created_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut run: WorkflowRun, reason: String) -> Result<(), RunStoreError> {
        let mut runs = self.runs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        if !matches!(run.status, RunStatus::DeadLettered { .. }) {
            run.status = RunStatus::DeadLettered {
                error: reason.clone(),
                attempts: run.attempt,
            };
        }
        run.updated_at = Utc::now();

        runs.remove(&run.id);
        dls.insert(run.id, DeadLetterEntry::new(run, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, RunStoreError> {
        let dls = self.dead_letters()?;
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, run_id: RunId) -> Result<WorkflowRun, RunStoreError> {
        let mut runs = self.runs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        let entry = dls.remove(&run_id).ok_or(RunStoreError::NotFound(run_id))?;

        let mut run = entry.run;
        run.status = RunStatus::Pending;
        run.attempt = 0;
        run.scheduled_at = None;
        run.updated_at = Utc::now();
        run.history.clear();

        runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn delete_dead_letter(&self, run_id: RunId) -> Result<(), RunStoreError> {
        self.dead_letters_mut()?
            .remove(&run_id)
            .map(|_| ())
            .ok_or(RunStoreError::NotFound(run_id))
    }

    fn stats(&self) -> Result<RunStats, RunStoreError> {
        let runs = self.runs()?;
        let dls = self.dead_letters()?;

        let mut stats = RunStats::default();
        for run in runs.values() {
            match &run.status {
                RunStatus::Pending => stats.pending += 1,
                RunStatus::Running { .. } => stats.running += 1,
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Failed { .. } => stats.failed += 1,
                RunStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.dead_lettered += dls.len();

        Ok(stats)
    }
}
