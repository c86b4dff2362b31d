//! Run executor: claims runs, hands them to the workflow handler, and applies
//! retry, backoff and dead-lettering to the result.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::{RunStore, RunStoreError};
use super::types::{RunResult, RunStatus, WorkflowRun};

/// Function that executes one attempt of a run.
pub type RunHandler = Arc<dyn Fn(&WorkflowRun) -> RunResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunExecutorConfig {
    /// Idle sleep between polls
    pub poll_interval: Duration,
    /// Per-attempt execution timeout; an attempt still running after it is
    /// treated as lost and the run becomes claimable again
    pub lease: Duration,
    /// Thread name and log field
    pub name: String,
}

impl Default for RunExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(300),
            name: "run-executor".to_string(),
        }
    }
}

impl RunExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Handle to control a running executor thread.
#[derive(Debug)]
pub struct RunExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl RunExecutorHandle {
    /// Request graceful shutdown and wait for the current run to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub runs_processed: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Polls a [`RunStore`] and executes claimed runs one at a time.
///
/// Cheap to clone; spawn several handles over one executor for parallelism.
#[derive(Clone)]
pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    handler: RunHandler,
}

impl RunExecutor {
    pub fn new<F>(store: Arc<dyn RunStore>, handler: F) -> Self
    where
        F: Fn(&WorkflowRun) -> RunResult + Send + Sync + 'static,
    {
        Self {
            store,
            handler: Arc::new(handler),
        }
    }

    /// Spawn a polling thread.
    pub fn spawn(&self, config: RunExecutorConfig) -> io::Result<RunExecutorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();
        let executor = self.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(executor, config, shutdown_rx, stats_clone))?;

        Ok(RunExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Claim and execute at most one run. Returns the run in its final state
    /// for this attempt, or `None` when nothing was claimable.
    pub fn run_next(&self, lease: Duration) -> Result<Option<WorkflowRun>, RunStoreError> {
        match self.store.claim_next(lease)? {
            Some(mut run) => {
                self.execute_claimed(&mut run)?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// Execute one attempt of a run that is already marked running.
    pub fn execute_claimed(&self, run: &mut WorkflowRun) -> Result<(), RunStoreError> {
        let started = Utc::now();

        match (self.handler)(run) {
            RunResult::Success => {
                run.mark_completed(started);
                self.store.update(run)?;
                debug!(run_id = %run.id, rule_id = %run.rule_id, attempt = run.attempt, "run completed");
            }
            RunResult::Failure(error) => {
                run.mark_failed(error.clone(), started);
                self.settle_failure(run, error)?;
            }
            RunResult::Permanent(error) => {
                run.mark_permanently_failed(error.clone(), started);
                self.settle_failure(run, error)?;
            }
            RunResult::RetryAfter(delay) => {
                run.mark_failed("retry requested".to_string(), started);
                if run.status.is_retriable() {
                    run.scheduled_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                }
                self.settle_failure(run, "retry requested".to_string())?;
            }
        }
        Ok(())
    }

    fn settle_failure(&self, run: &WorkflowRun, error: String) -> Result<(), RunStoreError> {
        if matches!(run.status, RunStatus::DeadLettered { .. }) {
            warn!(run_id = %run.id, rule_id = %run.rule_id, attempts = run.attempt, error = %error, "run dead-lettered");
            self.store.dead_letter(run.clone(), error)
        } else {
            debug!(run_id = %run.id, attempt = run.attempt, error = %error, scheduled_at = ?run.scheduled_at, "run will be retried");
            self.store.update(run)
        }
    }
}

fn executor_loop(
    executor: RunExecutor,
    config: RunExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "run executor started");
    let start_time = Instant::now();
    let update = |f: &dyn Fn(&mut ExecutorStats)| {
        if let Ok(mut s) = stats.lock() {
            f(&mut s);
        }
    };

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        update(&|s| s.uptime_secs = start_time.elapsed().as_secs());

        match executor.store.claim_next(config.lease) {
            Ok(Some(mut run)) => {
                debug!(executor = %config.name, run_id = %run.id, rule_id = %run.rule_id, attempt = run.attempt, "claimed run");
                update(&|s| s.current_running += 1);

                let result = executor.execute_claimed(&mut run);

                update(&|s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.runs_processed += 1;
                    match (&result, &run.status) {
                        (Ok(()), RunStatus::Completed) => s.runs_succeeded += 1,
                        (Ok(()), RunStatus::DeadLettered { .. }) => {
                            s.runs_failed += 1;
                            s.runs_dead_lettered += 1;
                        }
                        _ => s.runs_failed += 1,
                    }
                });

                if let Err(e) = result {
                    error!(executor = %config.name, run_id = %run.id, error = %e, "failed to record run result");
                }
            }
            Ok(None) => {
                thread::sleep(config.poll_interval);
            }
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim run");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "run executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::store::InMemoryRunStore;
    use crate::runs::types::RetryPolicy;
    use serde_json::Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stockflow_core::{EntityId, RuleId, UserId};
    use stockflow_events::TriggerEvent;

    const LEASE: Duration = Duration::from_secs(60);

    fn run() -> WorkflowRun {
        WorkflowRun::new(
            RuleId::new(),
            TriggerEvent::created("sales_orders", EntityId::new(), Map::new(), UserId::new()),
        )
    }

    #[test]
    fn successful_run_completes() {
        let store = InMemoryRunStore::arc();
        let executor = RunExecutor::new(store.clone(), |_run| RunResult::Success);
        let id = store.enqueue(run()).unwrap();

        let finished = executor.run_next(LEASE).unwrap().unwrap();

        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(store.get(id).unwrap().unwrap().status, RunStatus::Completed);
        assert!(executor.run_next(LEASE).unwrap().is_none());
    }

    #[test]
    fn failing_run_retries_then_dead_letters() {
        let store = InMemoryRunStore::arc();
        let executor = RunExecutor::new(store.clone(), |_run| RunResult::Failure("db down".into()));
        let id = store
            .enqueue(run().with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO)))
            .unwrap();

        let first = executor.run_next(LEASE).unwrap().unwrap();
        assert!(first.status.is_retriable());

        let second = executor.run_next(LEASE).unwrap().unwrap();
        assert!(matches!(second.status, RunStatus::DeadLettered { attempts: 2, .. }));
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.list_dead_letters(10).unwrap()[0].run.id, id);
    }

    #[test]
    fn permanent_failure_dead_letters_on_first_attempt() {
        let store = InMemoryRunStore::arc();
        let executor = RunExecutor::new(store.clone(), |_run| RunResult::Permanent("bad config".into()));
        store.enqueue(run()).unwrap();

        let finished = executor.run_next(LEASE).unwrap().unwrap();

        assert!(matches!(finished.status, RunStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(store.stats().unwrap().dead_lettered, 1);
    }

    #[test]
    fn spawned_executor_drains_the_store() {
        let store = InMemoryRunStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RunExecutor::new(store.clone(), move |_run| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunResult::Success
        });
        for _ in 0..3 {
            store.enqueue(run()).unwrap();
        }

        let handle = executor
            .spawn(RunExecutorConfig::default().with_poll_interval(Duration::from_millis(5)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.stats().unwrap().completed < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.stats().unwrap().completed, 3);
        assert!(stats.runs_succeeded <= 3);
    }
}
