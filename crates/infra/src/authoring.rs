//! Rule authoring.
//!
//! Rules start inactive. Each authoring step validates what it adds (action
//! configs through their handler, edges against the draft graph), and
//! `activate` requires the complete graph to build. Every successful
//! mutation refreshes the trigger processor's snapshot.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use stockflow_automation::{
    ActionEdge, ActionGraph, ActionTemplate, AutomationRule, ConfigError, GraphError, HandlerRegistry, RuleAction,
};
use stockflow_core::{ActionId, RuleId, TemplateId};

use crate::rules::{RuleStore, RuleStoreError};
use crate::trigger_processor::TriggerProcessor;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthoringError {
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),

    #[error("action {0} not found")]
    ActionNotFound(ActionId),

    #[error("template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("action {action}: {source}")]
    Config {
        action: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] RuleStoreError),
}

pub struct RuleService {
    rules: Arc<dyn RuleStore>,
    registry: Arc<HandlerRegistry>,
    trigger: Arc<TriggerProcessor>,
}

impl RuleService {
    pub fn new(rules: Arc<dyn RuleStore>, registry: Arc<HandlerRegistry>, trigger: Arc<TriggerProcessor>) -> Self {
        Self {
            rules,
            registry,
            trigger,
        }
    }

    /// Store a new rule. It is saved inactive regardless of `rule.is_active`.
    pub fn create_rule(&self, rule: AutomationRule) -> Result<AutomationRule, AuthoringError> {
        if rule.name.trim().is_empty() {
            return Err(AuthoringError::InvalidRule("name is required".into()));
        }
        if rule.entity_name.trim().is_empty() {
            return Err(AuthoringError::InvalidRule("entity name is required".into()));
        }
        if let Some(conditions) = &rule.conditions {
            conditions
                .validate()
                .map_err(|e| AuthoringError::InvalidRule(e.to_string()))?;
        }

        let rule = rule.inactive();
        self.rules.insert_rule(&rule)?;
        info!(rule_id = %rule.id, entity = %rule.entity_name, trigger_type = %rule.trigger_type, "rule created");
        self.refresh();
        Ok(rule)
    }

    pub fn add_template(&self, template: ActionTemplate) -> Result<ActionTemplate, AuthoringError> {
        if !self.registry.contains(&template.action_type) {
            return Err(AuthoringError::Config {
                action: template.name.clone(),
                source: ConfigError::UnknownActionType(template.action_type.clone()),
            });
        }
        self.rules.insert_template(&template)?;
        Ok(template)
    }

    /// Add a node after validating its effective config.
    pub fn add_action(&self, action: RuleAction) -> Result<RuleAction, AuthoringError> {
        self.require_rule(action.rule_id)?;
        self.validate_action(&action)?;

        let mut actions = self.rules.actions_for_rule(action.rule_id)?;
        actions.push(action.clone());
        let edges = self.rules.edges_for_rule(action.rule_id)?;
        ActionGraph::validate_draft(action.rule_id, &actions, &edges)?;

        self.rules.insert_action(&action)?;
        info!(rule_id = %action.rule_id, action_id = %action.id, action_type = %action.action_type, "action added");
        self.refresh();
        Ok(action)
    }

    /// Enable or disable one node; inactive nodes are passed through.
    pub fn set_action_active(&self, rule_id: RuleId, action_id: ActionId, active: bool) -> Result<(), AuthoringError> {
        let mut action = self
            .rules
            .actions_for_rule(rule_id)?
            .into_iter()
            .find(|a| a.id == action_id)
            .ok_or(AuthoringError::ActionNotFound(action_id))?;
        action.is_active = active;
        self.rules.update_action(&action)?;
        self.refresh();
        Ok(())
    }

    /// Add an edge. Active rules must stay complete; drafts only structurally sound.
    pub fn connect(&self, edge: ActionEdge) -> Result<(), AuthoringError> {
        let rule = self.require_rule(edge.rule_id)?;
        let actions = self.rules.actions_for_rule(rule.id)?;
        let mut edges = self.rules.edges_for_rule(rule.id)?;
        edges.push(edge.clone());

        if rule.is_active {
            ActionGraph::build(rule.id, actions, &edges)?;
        } else {
            ActionGraph::validate_draft(rule.id, &actions, &edges)?;
        }

        self.rules.insert_edge(&edge)?;
        self.refresh();
        Ok(())
    }

    /// Full check: complete graph plus every action's config.
    pub fn validate_rule(&self, rule_id: RuleId) -> Result<(), AuthoringError> {
        self.require_rule(rule_id)?;
        let actions = self.rules.actions_for_rule(rule_id)?;
        for action in &actions {
            self.validate_action(action)?;
        }
        let edges = self.rules.edges_for_rule(rule_id)?;
        ActionGraph::build(rule_id, actions, &edges)?;
        Ok(())
    }

    pub fn activate(&self, rule_id: RuleId) -> Result<AutomationRule, AuthoringError> {
        self.validate_rule(rule_id)?;
        self.set_active(rule_id, true)
    }

    pub fn deactivate(&self, rule_id: RuleId) -> Result<AutomationRule, AuthoringError> {
        self.set_active(rule_id, false)
    }

    /// Delete a rule together with its actions and edges.
    pub fn delete_rule(&self, rule_id: RuleId) -> Result<(), AuthoringError> {
        self.rules.delete_rule(rule_id).map_err(|e| match e {
            RuleStoreError::NotFound(_) => AuthoringError::RuleNotFound(rule_id),
            other => AuthoringError::Store(other),
        })?;
        info!(rule_id = %rule_id, "rule deleted");
        self.refresh();
        Ok(())
    }

    fn set_active(&self, rule_id: RuleId, active: bool) -> Result<AutomationRule, AuthoringError> {
        let mut rule = self.require_rule(rule_id)?;
        rule.is_active = active;
        self.rules.update_rule(&rule)?;
        info!(rule_id = %rule_id, active, "rule activation changed");
        self.refresh();
        Ok(rule)
    }

    fn validate_action(&self, action: &RuleAction) -> Result<(), AuthoringError> {
        let template = match action.template_id {
            Some(id) => Some(self.rules.get_template(id)?.ok_or(AuthoringError::TemplateNotFound(id))?),
            None => None,
        };
        self.registry
            .validate(action, template.as_ref())
            .map(|_| ())
            .map_err(|source| AuthoringError::Config {
                action: action.name.clone(),
                source,
            })
    }

    fn require_rule(&self, rule_id: RuleId) -> Result<AutomationRule, AuthoringError> {
        self.rules.get_rule(rule_id)?.ok_or(AuthoringError::RuleNotFound(rule_id))
    }

    // The mutation is already stored; a failed reload leaves the previous
    // snapshot until the next refresh.
    fn refresh(&self) {
        if let Err(e) = self.trigger.refresh() {
            warn!(error = %e, "rule snapshot refresh failed after authoring change");
        }
    }
}
