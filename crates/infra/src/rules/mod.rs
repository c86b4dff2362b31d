//! Rule definitions: rules, their action nodes and edges, and action templates.
//!
//! Actions and edges are owned by their rule; `delete_rule` removes all three
//! together. Graph validity is checked by the authoring service before
//! anything reaches a store, so stores only enforce identity and ownership.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use stockflow_automation::{ActionEdge, ActionTemplate, AutomationRule, RuleAction};
use stockflow_core::{ActionId, RuleId, TemplateId};

pub use in_memory::InMemoryRuleStore;
pub use postgres::PostgresRuleStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleStoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RuleStoreError {
    pub fn rule_not_found(id: RuleId) -> Self {
        Self::NotFound(format!("rule {id}"))
    }

    pub fn action_not_found(id: ActionId) -> Self {
        Self::NotFound(format!("action {id}"))
    }

    pub fn template_not_found(id: TemplateId) -> Self {
        Self::NotFound(format!("template {id}"))
    }
}

pub trait RuleStore: Send + Sync {
    fn list_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError>;

    /// Rules with `is_active` set, the trigger processor's snapshot source.
    fn list_active_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError>;

    fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>, RuleStoreError>;

    fn insert_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError>;

    fn update_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError>;

    /// Delete a rule with its actions and edges.
    fn delete_rule(&self, id: RuleId) -> Result<(), RuleStoreError>;

    fn insert_action(&self, action: &RuleAction) -> Result<(), RuleStoreError>;

    fn update_action(&self, action: &RuleAction) -> Result<(), RuleStoreError>;

    fn actions_for_rule(&self, rule_id: RuleId) -> Result<Vec<RuleAction>, RuleStoreError>;

    fn insert_edge(&self, edge: &ActionEdge) -> Result<(), RuleStoreError>;

    /// Edges ordered by `edge_order`.
    fn edges_for_rule(&self, rule_id: RuleId) -> Result<Vec<ActionEdge>, RuleStoreError>;

    fn insert_template(&self, template: &ActionTemplate) -> Result<(), RuleStoreError>;

    fn get_template(&self, id: TemplateId) -> Result<Option<ActionTemplate>, RuleStoreError>;
}

impl<S> RuleStore for Arc<S>
where
    S: RuleStore + ?Sized,
{
    fn list_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        (**self).list_rules()
    }

    fn list_active_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        (**self).list_active_rules()
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>, RuleStoreError> {
        (**self).get_rule(id)
    }

    fn insert_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        (**self).insert_rule(rule)
    }

    fn update_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        (**self).update_rule(rule)
    }

    fn delete_rule(&self, id: RuleId) -> Result<(), RuleStoreError> {
        (**self).delete_rule(id)
    }

    fn insert_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        (**self).insert_action(action)
    }

    fn update_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        (**self).update_action(action)
    }

    fn actions_for_rule(&self, rule_id: RuleId) -> Result<Vec<RuleAction>, RuleStoreError> {
        (**self).actions_for_rule(rule_id)
    }

    fn insert_edge(&self, edge: &ActionEdge) -> Result<(), RuleStoreError> {
        (**self).insert_edge(edge)
    }

    fn edges_for_rule(&self, rule_id: RuleId) -> Result<Vec<ActionEdge>, RuleStoreError> {
        (**self).edges_for_rule(rule_id)
    }

    fn insert_template(&self, template: &ActionTemplate) -> Result<(), RuleStoreError> {
        (**self).insert_template(template)
    }

    fn get_template(&self, id: TemplateId) -> Result<Option<ActionTemplate>, RuleStoreError> {
        (**self).get_template(id)
    }
}
