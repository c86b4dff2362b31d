//! Action graph executor.
//!
//! One execution loads the rule's actions, edges and templates once, builds an
//! [`ActionGraph`] and walks it from the start edge:
//!
//! - an inactive node is skipped and its `sequential` edge followed
//! - a node already in the [`StepJournal`] for this execution is not run
//!   again; its recorded edge is followed
//! - otherwise the node's handler runs under a per-node context and the edge
//!   for its output port is followed
//!
//! A node without an outgoing edge of the required type ends the run
//! successfully. Nodes run strictly one after another.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use stockflow_automation::{
    ActionError, ActionGraph, ActionOutcome, ActionTemplate, ConfigError, EdgeType, ExecutionContext, GraphError,
    HandlerRegistry, RuleAction,
};
use stockflow_core::{ActionId, ExecutionId, RuleId, TemplateId};

use crate::rules::{RuleStore, RuleStoreError};
use crate::runs::{RunResult, RunStoreError, StepJournal, StepRecord, WorkflowRun};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("action {action_id}: {source}")]
    Config {
        action_id: ActionId,
        #[source]
        source: ConfigError,
    },

    #[error("action {action_id} ({action_type}) failed: {source}")]
    Action {
        action_id: ActionId,
        action_type: String,
        #[source]
        source: ActionError,
    },

    #[error("{0} cannot be executed manually")]
    ManualNotSupported(String),

    #[error(transparent)]
    Rules(#[from] RuleStoreError),

    #[error("step journal: {0}")]
    Journal(#[from] RunStoreError),
}

impl ExecutionError {
    /// Errors a retry cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            ExecutionError::RuleNotFound(_)
            | ExecutionError::TemplateNotFound(_)
            | ExecutionError::Graph(_)
            | ExecutionError::Config { .. }
            | ExecutionError::ManualNotSupported(_) => true,
            ExecutionError::Action { source, .. } => source.is_permanent(),
            ExecutionError::Rules(RuleStoreError::Serialization(_)) => true,
            ExecutionError::Rules(_) | ExecutionError::Journal(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executed,
    /// Completed by an earlier attempt of the same execution.
    Replayed,
    /// Inactive node.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub action_id: ActionId,
    pub action_type: String,
    pub status: StepStatus,
    pub port: Option<String>,
    pub edge: EdgeType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub rule_id: RuleId,
    pub execution_id: ExecutionId,
    pub steps: Vec<StepSummary>,
}

impl RunSummary {
    /// Output port of the last executed or replayed node.
    pub fn last_port(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| s.port.as_deref())
    }

    pub fn executed(&self) -> impl Iterator<Item = &StepSummary> {
        self.steps.iter().filter(|s| s.status == StepStatus::Executed)
    }
}

pub struct GraphExecutor {
    rules: Arc<dyn RuleStore>,
    registry: Arc<HandlerRegistry>,
    journal: Arc<dyn StepJournal>,
}

impl GraphExecutor {
    pub fn new(rules: Arc<dyn RuleStore>, registry: Arc<HandlerRegistry>, journal: Arc<dyn StepJournal>) -> Self {
        Self {
            rules,
            registry,
            journal,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Load a rule's graph, resolving each action's template.
    pub fn load_graph(&self, rule_id: RuleId) -> Result<(ActionGraph, HashMap<TemplateId, ActionTemplate>), ExecutionError> {
        let actions = self.rules.actions_for_rule(rule_id)?;
        let edges = self.rules.edges_for_rule(rule_id)?;

        let mut templates = HashMap::new();
        for template_id in actions.iter().filter_map(|a| a.template_id) {
            if templates.contains_key(&template_id) {
                continue;
            }
            let template = self
                .rules
                .get_template(template_id)?
                .ok_or(ExecutionError::TemplateNotFound(template_id))?;
            templates.insert(template_id, template);
        }

        Ok((ActionGraph::build(rule_id, actions, &edges)?, templates))
    }

    /// Walk `rule_id`'s graph under `ctx`.
    #[instrument(skip(self, ctx), fields(execution_id = %ctx.execution_id))]
    pub fn execute(&self, rule_id: RuleId, ctx: &ExecutionContext) -> Result<RunSummary, ExecutionError> {
        if self.rules.get_rule(rule_id)?.is_none() {
            return Err(ExecutionError::RuleNotFound(rule_id));
        }
        let (graph, templates) = self.load_graph(rule_id)?;

        let journaled: HashMap<ActionId, StepRecord> = self
            .journal
            .steps(ctx.execution_id)?
            .into_iter()
            .map(|s| (s.action_id, s))
            .collect();

        let mut summary = RunSummary {
            rule_id,
            execution_id: ctx.execution_id,
            steps: Vec::with_capacity(graph.len()),
        };

        // Acyclic, so at most one visit per node.
        let mut node = Some(graph.start());
        while let Some(action) = node {
            let step = if !action.is_active {
                debug!(action_id = %action.id, action_type = %action.action_type, "skipping inactive action");
                StepSummary {
                    action_id: action.id,
                    action_type: action.action_type.clone(),
                    status: StepStatus::Skipped,
                    port: None,
                    edge: EdgeType::Sequential,
                }
            } else if let Some(record) = journaled.get(&action.id) {
                debug!(action_id = %action.id, port = %record.outcome.port, "replaying journaled action");
                StepSummary {
                    action_id: action.id,
                    action_type: action.action_type.clone(),
                    status: StepStatus::Replayed,
                    port: Some(record.outcome.port.clone()),
                    edge: record.edge,
                }
            } else {
                let template = action.template_id.and_then(|id| templates.get(&id));
                let (outcome, edge) = self.run_node(action, template, ctx)?;
                self.journal.record(
                    ctx.execution_id,
                    StepRecord {
                        action_id: action.id,
                        action_type: action.action_type.clone(),
                        outcome: outcome.clone(),
                        edge,
                        completed_at: Utc::now(),
                    },
                )?;
                StepSummary {
                    action_id: action.id,
                    action_type: action.action_type.clone(),
                    status: StepStatus::Executed,
                    port: Some(outcome.port),
                    edge,
                }
            };

            node = graph.next(action.id, step.edge);
            if node.is_none() {
                debug!(action_id = %action.id, edge = %step.edge, "no outgoing edge; execution finished");
            }
            summary.steps.push(step);
        }

        info!(
            rule_id = %rule_id,
            steps = summary.steps.len(),
            last_port = summary.last_port().unwrap_or("-"),
            "rule execution completed"
        );
        Ok(summary)
    }

    fn run_node(
        &self,
        action: &RuleAction,
        template: Option<&ActionTemplate>,
        ctx: &ExecutionContext,
    ) -> Result<(ActionOutcome, EdgeType), ExecutionError> {
        let config = self
            .registry
            .validate(action, template)
            .map_err(|source| ExecutionError::Config {
                action_id: action.id,
                source,
            })?;
        // validate() succeeded, so the handler is registered.
        let handler = self.registry.get(&action.action_type).ok_or_else(|| ExecutionError::Config {
            action_id: action.id,
            source: ConfigError::UnknownActionType(action.action_type.clone()),
        })?;

        let outcome = handler
            .execute(&config, &ctx.for_step(action.id))
            .map_err(|source| ExecutionError::Action {
                action_id: action.id,
                action_type: action.action_type.clone(),
                source,
            })?;
        let edge = handler.next_edge(&outcome);
        debug!(action_id = %action.id, action_type = %action.action_type, port = %outcome.port, edge = %edge, "action executed");
        Ok((outcome, edge))
    }

    /// Execute one attempt of a durable run. A finished execution's journal is
    /// dropped; a failed one keeps it for the next attempt.
    pub fn execute_run(&self, run: &WorkflowRun) -> Result<RunSummary, ExecutionError> {
        let ctx = ExecutionContext::from_event(run.execution_id, run.rule_id, &run.event);
        let summary = self.execute(run.rule_id, &ctx)?;
        if let Err(e) = self.journal.clear(run.execution_id) {
            warn!(execution_id = %run.execution_id, error = %e, "failed to clear step journal");
        }
        Ok(summary)
    }

    /// [`execute_run`](Self::execute_run) mapped onto the run executor's result.
    pub fn run_result(&self, run: &WorkflowRun) -> RunResult {
        match self.execute_run(run) {
            Ok(_) => RunResult::Success,
            Err(e) if e.is_permanent() => {
                warn!(run_id = %run.id, rule_id = %run.rule_id, error = %e, "rule execution failed permanently");
                RunResult::Permanent(e.to_string())
            }
            Err(e) => {
                warn!(run_id = %run.id, rule_id = %run.rule_id, attempt = run.attempt, error = %e, "rule execution failed");
                RunResult::Failure(e.to_string())
            }
        }
    }

    /// Run a single action outside any rule. Only handlers that allow manual
    /// execution accept this; the idempotency key uses `manual` for the rule.
    #[instrument(skip(self, action, template, ctx), fields(action_type = %action.action_type, execution_id = %ctx.execution_id))]
    pub fn execute_manual(
        &self,
        action: &RuleAction,
        template: Option<&ActionTemplate>,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutcome, ExecutionError> {
        let handler = self.registry.get(&action.action_type).ok_or_else(|| ExecutionError::Config {
            action_id: action.id,
            source: ConfigError::UnknownActionType(action.action_type.clone()),
        })?;
        if !handler.supports_manual_execution() {
            return Err(ExecutionError::ManualNotSupported(action.action_type.clone()));
        }
        let config = self
            .registry
            .validate(action, template)
            .map_err(|source| ExecutionError::Config {
                action_id: action.id,
                source,
            })?;
        let manual = ExecutionContext {
            rule_id: None,
            ..ctx.clone()
        };
        let outcome = handler.execute(&config, &manual).map_err(|source| ExecutionError::Action {
            action_id: action.id,
            action_type: action.action_type.clone(),
            source,
        })?;
        info!(port = %outcome.port, "manual action executed");
        Ok(outcome)
    }
}

impl core::fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GraphExecutor").field("registry", &self.registry).finish()
    }
}
