use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockflow_core::{ActionId, DomainError, RuleId, TemplateId, UserId};
use stockflow_events::{TriggerEvent, TriggerType};

use crate::condition::TriggerConditions;

/// A user-defined binding of (entity, trigger type, optional condition) to an
/// action graph. Only evaluated while `is_active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub name: String,
    pub description: Option<String>,
    pub entity_name: String,
    pub trigger_type: TriggerType,
    pub conditions: Option<TriggerConditions>,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn new(
        name: impl Into<String>,
        entity_name: impl Into<String>,
        trigger_type: TriggerType,
        created_by: UserId,
    ) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            description: None,
            entity_name: entity_name.into(),
            trigger_type,
            conditions: None,
            is_active: true,
            created_by,
            created_at: Utc::now(),
        }
    }

    pub fn with_conditions(mut self, conditions: TriggerConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Whether this rule fires for `event`. Absent conditions always match.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        self.is_active
            && self.entity_name == event.entity_name()
            && self.trigger_type == event.event_type()
            && self
                .conditions
                .as_ref()
                .is_none_or(|conditions| conditions.evaluate(event))
    }
}

/// Reusable default configuration a [`RuleAction`] may inherit from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: TemplateId,
    pub name: String,
    pub action_type: String,
    pub default_config: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl ActionTemplate {
    pub fn new(name: impl Into<String>, action_type: impl Into<String>, default_config: JsonValue) -> Self {
        Self {
            id: TemplateId::new(),
            name: name.into(),
            action_type: action_type.into(),
            default_config,
            created_at: Utc::now(),
        }
    }
}

/// A node in a rule's action graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub id: ActionId,
    pub rule_id: RuleId,
    pub name: String,
    pub action_type: String,
    pub template_id: Option<TemplateId>,
    /// Per-instance overrides, shallow-merged over template defaults.
    pub config: JsonValue,
    pub is_active: bool,
}

impl RuleAction {
    pub fn new(rule_id: RuleId, name: impl Into<String>, action_type: impl Into<String>, config: JsonValue) -> Self {
        Self {
            id: ActionId::new(),
            rule_id,
            name: name.into(),
            action_type: action_type.into(),
            template_id: None,
            config,
            is_active: true,
        }
    }

    pub fn from_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Graph entry; has no source action.
    Start,
    Sequential,
    TrueBranch,
    FalseBranch,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Start => "start",
            EdgeType::Sequential => "sequential",
            EdgeType::TrueBranch => "true_branch",
            EdgeType::FalseBranch => "false_branch",
        }
    }

    /// Branch edge for a boolean condition result.
    pub fn for_condition(taken: bool) -> Self {
        if taken {
            EdgeType::TrueBranch
        } else {
            EdgeType::FalseBranch
        }
    }
}

impl core::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EdgeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EdgeType::Start),
            "sequential" => Ok(EdgeType::Sequential),
            "true_branch" => Ok(EdgeType::TrueBranch),
            "false_branch" => Ok(EdgeType::FalseBranch),
            other => Err(DomainError::validation(format!("unknown edge type: {other}"))),
        }
    }
}

/// A directed edge of a rule's action graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEdge {
    pub rule_id: RuleId,
    /// `None` only for the rule's single `start` edge.
    pub source_action_id: Option<ActionId>,
    pub target_action_id: ActionId,
    pub edge_type: EdgeType,
    pub edge_order: i32,
}

impl ActionEdge {
    pub fn start(rule_id: RuleId, target: ActionId) -> Self {
        Self {
            rule_id,
            source_action_id: None,
            target_action_id: target,
            edge_type: EdgeType::Start,
            edge_order: 0,
        }
    }

    pub fn between(rule_id: RuleId, source: ActionId, target: ActionId, edge_type: EdgeType) -> Self {
        Self {
            rule_id,
            source_action_id: Some(source),
            target_action_id: target,
            edge_type,
            edge_order: 0,
        }
    }
}
