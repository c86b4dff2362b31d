//! Wiring: stores → handlers → trigger processor → dispatcher → executors.

use std::io;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::info;

use stockflow_automation::HandlerRegistry;
use stockflow_events::Delegate;

use crate::authoring::RuleService;
use crate::config::EngineConfig;
use crate::handlers::{InventoryServices, register_inventory_handlers};
use crate::ledger::{AllocationResultStore, InMemoryLedger, InventoryLedger, PostgresLedger};
use crate::references::{InMemoryReferences, PostgresReferences, ReferenceLookup};
use crate::rules::{InMemoryRuleStore, PostgresRuleStore, RuleStore, RuleStoreError};
use crate::runs::{
    InMemoryRunStore, InMemoryStepJournal, RunExecutor, RunExecutorHandle, RunStore, RunStoreError, StepJournal,
    WorkflowRun,
};
use crate::sweeper::{ReservationSweeper, SweeperHandle};
use crate::trigger_processor::TriggerProcessor;
use crate::workflow::{GraphExecutor, WorkflowDispatcher};

/// The storage an engine runs on.
#[derive(Clone)]
pub struct EngineStores {
    pub ledger: Arc<dyn InventoryLedger>,
    pub results: Arc<dyn AllocationResultStore>,
    pub references: Arc<dyn ReferenceLookup>,
    pub rules: Arc<dyn RuleStore>,
    pub runs: Arc<dyn RunStore>,
    pub journal: Arc<dyn StepJournal>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        Self::in_memory_with(InMemoryLedger::arc(), Arc::new(InMemoryReferences::new()))
    }

    /// In-memory stores around a ledger and reference data the caller keeps
    /// handles to.
    pub fn in_memory_with(ledger: Arc<InMemoryLedger>, references: Arc<InMemoryReferences>) -> Self {
        Self {
            results: ledger.results(),
            ledger,
            references,
            rules: InMemoryRuleStore::arc(),
            runs: InMemoryRunStore::arc(),
            journal: Arc::new(InMemoryStepJournal::new()),
        }
    }

    /// Postgres ledger, results, references and rules. Runs and the step
    /// journal stay in process memory.
    pub fn postgres(pool: PgPool, handle: Handle) -> Self {
        let ledger = PostgresLedger::new(pool.clone(), handle.clone());
        Self {
            results: Arc::new(ledger.results()),
            ledger: Arc::new(ledger),
            references: Arc::new(PostgresReferences::new(pool.clone(), handle.clone())),
            rules: Arc::new(PostgresRuleStore::new(pool, handle)),
            runs: InMemoryRunStore::arc(),
            journal: Arc::new(InMemoryStepJournal::new()),
        }
    }
}

pub struct Engine {
    pub delegate: Arc<Delegate>,
    pub trigger: Arc<TriggerProcessor>,
    pub dispatcher: Arc<WorkflowDispatcher>,
    pub executor: Arc<GraphExecutor>,
    pub authoring: Arc<RuleService>,
    pub sweeper: Arc<ReservationSweeper>,
    pub runs: Arc<dyn RunStore>,
    config: EngineConfig,
}

impl Engine {
    /// Wire everything and load the first rule snapshot. The dispatcher is
    /// registered on the returned delegate.
    pub fn build(stores: EngineStores, config: EngineConfig) -> Result<Self, RuleStoreError> {
        let services = InventoryServices::new(stores.ledger.clone(), stores.results.clone(), stores.references.clone())
            .with_default_reservation_hours(config.default_reservation_hours);
        let mut registry = HandlerRegistry::new();
        register_inventory_handlers(&mut registry, &services);
        let registry = Arc::new(registry);

        let trigger = Arc::new(TriggerProcessor::load(stores.rules.clone())?);
        let dispatcher = Arc::new(
            WorkflowDispatcher::new(trigger.clone(), stores.runs.clone()).with_retry_policy(config.retry_policy()),
        );
        let executor = Arc::new(GraphExecutor::new(stores.rules.clone(), registry.clone(), stores.journal.clone()));
        let authoring = Arc::new(RuleService::new(stores.rules.clone(), registry.clone(), trigger.clone()));
        let sweeper = Arc::new(ReservationSweeper::new(stores.ledger.clone()));

        let delegate = Arc::new(Delegate::new());
        delegate.register(dispatcher.clone());

        info!(handlers = registry.len(), active_rules = trigger.snapshot().len(), "engine ready");
        Ok(Self {
            delegate,
            trigger,
            dispatcher,
            executor,
            authoring,
            sweeper,
            runs: stores.runs,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A run executor that drives runs through the graph executor.
    pub fn run_executor(&self) -> RunExecutor {
        let executor = self.executor.clone();
        RunExecutor::new(self.runs.clone(), move |run: &WorkflowRun| executor.run_result(run))
    }

    /// Execute claimable runs on the calling thread until none is left.
    /// Runs waiting on a backoff delay are left for later.
    pub fn drain(&self) -> Result<usize, RunStoreError> {
        let executor = self.run_executor();
        let mut processed = 0;
        while executor.run_next(self.config.run_lease)?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Start executor threads and the reservation sweeper.
    pub fn start(&self) -> io::Result<EngineHandles> {
        let executor = self.run_executor();
        let executors = (0..self.config.executor_workers)
            .map(|i| executor.spawn(self.config.executor_config(i)))
            .collect::<io::Result<Vec<_>>>()?;
        let sweeper = self.sweeper.clone().spawn(self.config.reservation_sweep_interval)?;
        info!(workers = executors.len(), "engine started");
        Ok(EngineHandles { executors, sweeper })
    }
}

#[derive(Debug)]
pub struct EngineHandles {
    executors: Vec<RunExecutorHandle>,
    sweeper: SweeperHandle,
}

impl EngineHandles {
    pub fn shutdown(self) {
        for executor in self.executors {
            executor.shutdown();
        }
        self.sweeper.shutdown();
        info!("engine stopped");
    }
}
