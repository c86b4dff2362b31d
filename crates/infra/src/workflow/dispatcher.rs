//! Workflow dispatcher: one durable run per matching rule.
//!
//! Per-rule enqueue failures are recorded in the [`DispatchReport`] and do not
//! stop dispatch to the remaining rules. An unreachable run backend ends the
//! call with [`DispatchError::BackendUnavailable`], which still carries the
//! runs enqueued before the backend went away.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockflow_core::{RuleId, RunId};
use stockflow_events::{EventListener, ListenerError, Outcome, Subscription, TriggerEvent};

use crate::runs::{RetryPolicy, RunStore, RunStoreError, WorkflowRun};
use crate::trigger_processor::TriggerProcessor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// `report` holds the rules handled before the backend failed; their
    /// runs exist and must not be dispatched again.
    #[error("run backend unavailable after {} rule(s): {reason}", .report.outcomes.len())]
    BackendUnavailable { reason: String, report: DispatchReport },
}

impl DispatchError {
    pub fn partial_report(&self) -> &DispatchReport {
        match self {
            DispatchError::BackendUnavailable { report, .. } => report,
        }
    }
}

/// Per-rule result of dispatching one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<(RuleId, Outcome<RunId>)>,
}

impl DispatchReport {
    pub fn dispatched(&self) -> impl Iterator<Item = RunId> + '_ {
        self.outcomes.iter().filter_map(|(_, o)| match o {
            Outcome::Success(id) => Some(*id),
            Outcome::LoggedFailure(_) => None,
        })
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| !o.is_success()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

pub struct WorkflowDispatcher {
    trigger: Arc<TriggerProcessor>,
    runs: Arc<dyn RunStore>,
    retry_policy: RetryPolicy,
}

impl WorkflowDispatcher {
    pub fn new(trigger: Arc<TriggerProcessor>, runs: Arc<dyn RunStore>) -> Self {
        Self {
            trigger,
            runs,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn on_entity_event(&self, event: &TriggerEvent) -> Result<DispatchReport, DispatchError> {
        let rules = self.trigger.matching(event);
        let mut report = DispatchReport {
            outcomes: Vec::with_capacity(rules.len()),
        };

        for rule in rules {
            let run = WorkflowRun::new(rule.id, event.clone()).with_retry_policy(self.retry_policy.clone());
            let execution_id = run.execution_id;
            match self.runs.enqueue(run) {
                Ok(run_id) => {
                    debug!(rule_id = %rule.id, run_id = %run_id, execution_id = %execution_id, "run enqueued");
                    report.outcomes.push((rule.id, Outcome::Success(run_id)));
                }
                Err(RunStoreError::Unavailable(reason)) => {
                    error!(
                        rule_id = %rule.id,
                        error = %reason,
                        already_enqueued = report.dispatched().count(),
                        "run backend unavailable"
                    );
                    return Err(DispatchError::BackendUnavailable { reason, report });
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, entity = event.entity_name(), error = %e, "failed to dispatch rule");
                    report.outcomes.push((rule.id, Outcome::LoggedFailure(e.to_string())));
                }
            }
        }

        if !report.is_empty() {
            info!(
                entity = event.entity_name(),
                entity_id = %event.entity_id(),
                event_type = %event.event_type(),
                dispatched = report.outcomes.len() - report.failures(),
                failed = report.failures(),
                "trigger event dispatched"
            );
        }
        Ok(report)
    }

    /// Consume events from a bus subscription on a dedicated thread.
    pub fn spawn_consumer(
        self: Arc<Self>,
        subscription: Subscription,
        poll_interval: Duration,
    ) -> io::Result<ConsumerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let join = thread::Builder::new()
            .name("workflow-dispatcher".into())
            .spawn(move || {
                info!("dispatcher consumer started");
                while !flag.load(Ordering::Relaxed) {
                    match subscription.recv_timeout(poll_interval) {
                        Ok(event) => {
                            if let Err(e) = self.on_entity_event(&event) {
                                let enqueued: Vec<String> =
                                    e.partial_report().dispatched().map(|id| id.to_string()).collect();
                                error!(
                                    entity = event.entity_name(),
                                    error = %e,
                                    enqueued = ?enqueued,
                                    "dropping rest of event"
                                );
                            }
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("dispatcher consumer stopped");
            })?;
        Ok(ConsumerHandle { stop, join: Some(join) })
    }
}

impl EventListener for WorkflowDispatcher {
    fn name(&self) -> &str {
        "workflow_dispatcher"
    }

    fn on_event(&self, event: &TriggerEvent) -> Result<(), ListenerError> {
        self.on_entity_event(event)
            .map(|_| ())
            .map_err(|e| ListenerError::new(e.to_string()))
    }
}

#[derive(Debug)]
pub struct ConsumerHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{InMemoryRuleStore, RuleStore};
    use crate::runs::{InMemoryRunStore, RunStats};
    use serde_json::Map;
    use stockflow_automation::AutomationRule;
    use stockflow_core::{EntityId, UserId};
    use stockflow_events::{BusForwarder, Delegate, EventBus, InMemoryEventBus, TriggerType};

    /// Accepts a fixed number of runs, then fails with `error`.
    struct FlakyRuns {
        inner: InMemoryRunStore,
        accept: usize,
        error: RunStoreError,
    }

    impl RunStore for FlakyRuns {
        fn enqueue(&self, run: WorkflowRun) -> Result<RunId, RunStoreError> {
            if self.inner.stats()?.pending >= self.accept {
                return Err(self.error.clone());
            }
            self.inner.enqueue(run)
        }
        fn get(&self, run_id: RunId) -> Result<Option<WorkflowRun>, RunStoreError> {
            self.inner.get(run_id)
        }
        fn update(&self, run: &WorkflowRun) -> Result<(), RunStoreError> {
            self.inner.update(run)
        }
        fn claim_next(&self, lease: Duration) -> Result<Option<WorkflowRun>, RunStoreError> {
            self.inner.claim_next(lease)
        }
        fn list_by_status(
            &self,
            status: Option<&crate::runs::RunStatus>,
            limit: usize,
        ) -> Result<Vec<WorkflowRun>, RunStoreError> {
            self.inner.list_by_status(status, limit)
        }
        fn list_for_rule(&self, rule_id: RuleId, limit: usize) -> Result<Vec<WorkflowRun>, RunStoreError> {
            self.inner.list_for_rule(rule_id, limit)
        }
        fn dead_letter(&self, run: WorkflowRun, reason: String) -> Result<(), RunStoreError> {
            self.inner.dead_letter(run, reason)
        }
        fn list_dead_letters(&self, limit: usize) -> Result<Vec<crate::runs::DeadLetterEntry>, RunStoreError> {
            self.inner.list_dead_letters(limit)
        }
        fn retry_dead_letter(&self, run_id: RunId) -> Result<WorkflowRun, RunStoreError> {
            self.inner.retry_dead_letter(run_id)
        }
        fn delete_dead_letter(&self, run_id: RunId) -> Result<(), RunStoreError> {
            self.inner.delete_dead_letter(run_id)
        }
        fn stats(&self) -> Result<RunStats, RunStoreError> {
            self.inner.stats()
        }
    }

    fn processor(rule_count: usize) -> Arc<TriggerProcessor> {
        let rules = InMemoryRuleStore::arc();
        for i in 0..rule_count {
            let rule = AutomationRule::new(format!("rule {i}"), "sales_orders", TriggerType::OnCreate, UserId::new());
            rules.insert_rule(&rule).unwrap();
        }
        Arc::new(TriggerProcessor::load(rules).unwrap())
    }

    fn event() -> TriggerEvent {
        TriggerEvent::created("sales_orders", EntityId::new(), Map::new(), UserId::new())
    }

    #[test]
    fn one_run_per_matching_rule() {
        let runs = InMemoryRunStore::arc();
        let dispatcher = WorkflowDispatcher::new(processor(2), runs.clone());

        let report = dispatcher.on_entity_event(&event()).unwrap();

        assert_eq!(report.dispatched().count(), 2);
        assert_eq!(runs.stats().unwrap().pending, 2);

        let unmatched = TriggerEvent::created("invoices", EntityId::new(), Map::new(), UserId::new());
        assert!(dispatcher.on_entity_event(&unmatched).unwrap().is_empty());
    }

    #[test]
    fn per_rule_enqueue_failure_is_logged_not_raised() {
        let runs = Arc::new(FlakyRuns {
            inner: InMemoryRunStore::new(),
            accept: 1,
            error: RunStoreError::Storage("disk full".into()),
        });
        let dispatcher = WorkflowDispatcher::new(processor(3), runs);

        let report = dispatcher.on_entity_event(&event()).unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.dispatched().count(), 1);
        assert_eq!(report.failures(), 2);
    }

    #[test]
    fn unavailable_backend_is_surfaced() {
        let runs = Arc::new(FlakyRuns {
            inner: InMemoryRunStore::new(),
            accept: 0,
            error: RunStoreError::Unavailable("connection refused".into()),
        });
        let dispatcher = WorkflowDispatcher::new(processor(1), runs);

        assert_eq!(
            dispatcher.on_entity_event(&event()),
            Err(DispatchError::BackendUnavailable {
                reason: "connection refused".into(),
                report: DispatchReport::default(),
            })
        );
    }

    #[test]
    fn backend_loss_mid_dispatch_reports_runs_already_enqueued() {
        let runs = Arc::new(FlakyRuns {
            inner: InMemoryRunStore::new(),
            accept: 1,
            error: RunStoreError::Unavailable("connection refused".into()),
        });
        let dispatcher = WorkflowDispatcher::new(processor(3), runs.clone());

        let err = dispatcher.on_entity_event(&event()).unwrap_err();

        let report = err.partial_report();
        let enqueued: Vec<RunId> = report.dispatched().collect();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(report.failures(), 0);
        assert_eq!(runs.stats().unwrap().pending, 1);
        let queued = runs.get(enqueued[0]).unwrap().expect("reported run is stored");
        assert_eq!(report.outcomes[0].0, queued.rule_id);
        assert!(err.to_string().contains("after 1 rule(s)"));
    }

    #[test]
    fn delegate_outcome_records_backend_failure_without_raising() {
        let runs = Arc::new(FlakyRuns {
            inner: InMemoryRunStore::new(),
            accept: 0,
            error: RunStoreError::Unavailable("down".into()),
        });
        let delegate = Delegate::new();
        delegate.register(Arc::new(WorkflowDispatcher::new(processor(1), runs)));

        let outcomes = delegate.notify(&event());

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].outcome.failure().is_some());
    }

    #[test]
    fn consumer_dispatches_bus_events() {
        let runs = InMemoryRunStore::arc();
        let dispatcher = Arc::new(WorkflowDispatcher::new(processor(1), runs.clone()));
        let bus = Arc::new(InMemoryEventBus::new());
        let handle = dispatcher
            .spawn_consumer(bus.subscribe(), Duration::from_millis(5))
            .unwrap();

        let delegate = Delegate::new();
        delegate.register(Arc::new(BusForwarder::new(bus.clone())));
        delegate.notify(&event());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.stats().unwrap().pending == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(runs.stats().unwrap().pending, 1);
    }
}
