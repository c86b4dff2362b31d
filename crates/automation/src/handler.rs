//! Action handler contract and registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use stockflow_core::{ActionId, DomainError, EntityId, ExecutionId, RuleId, UserId};
use stockflow_events::{TriggerEvent, TriggerType};

use crate::config::{ActionConfig, ConfigError};
use crate::idempotency::IdempotencyKey;
use crate::rule::{ActionTemplate, EdgeType, RuleAction};

/// Everything a handler knows about why it is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    /// `None` for manual executions.
    pub rule_id: Option<RuleId>,
    pub entity_name: String,
    pub entity_id: EntityId,
    pub event_type: Option<TriggerType>,
    pub raw_data: Map<String, JsonValue>,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn from_event(execution_id: ExecutionId, rule_id: RuleId, event: &TriggerEvent) -> Self {
        Self {
            execution_id,
            rule_id: Some(rule_id),
            entity_name: event.entity_name().to_string(),
            entity_id: event.entity_id(),
            event_type: Some(event.event_type()),
            raw_data: event.raw_data().clone(),
            user_id: event.user_id(),
            timestamp: event.timestamp(),
        }
    }

    /// Context for running one action outside any rule.
    pub fn manual(
        entity_name: impl Into<String>,
        entity_id: EntityId,
        raw_data: Map<String, JsonValue>,
        user_id: UserId,
    ) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            rule_id: None,
            entity_name: entity_name.into(),
            entity_id,
            event_type: None,
            raw_data,
            user_id,
            timestamp: Utc::now(),
        }
    }

    /// Child context for one graph node. Each node gets its own stable
    /// execution id so two nodes of the same type never share a key.
    pub fn for_step(&self, action_id: ActionId) -> Self {
        Self {
            execution_id: self.execution_id.for_step(action_id.as_uuid()),
            ..self.clone()
        }
    }

    pub fn idempotency_key(&self, action_type: &str) -> IdempotencyKey {
        IdempotencyKey::new(self.execution_id, self.rule_id, action_type)
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.raw_data.get(name)
    }
}

/// Result of one handler invocation: the port it exits through plus a
/// payload for logs and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub port: String,
    pub data: JsonValue,
}

impl ActionOutcome {
    pub fn new(port: impl Into<String>, data: JsonValue) -> Self {
        Self {
            port: port.into(),
            data,
        }
    }
}

/// Named exit a graph editor can wire edges to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPort {
    pub name: &'static str,
    pub description: &'static str,
    /// Branch edge followed when the handler exits here; `None` is
    /// informational and continues along the sequential edge.
    pub edge: Option<EdgeType>,
}

impl OutputPort {
    pub const fn branch(name: &'static str, description: &'static str, edge: EdgeType) -> Self {
        Self {
            name,
            description,
            edge: Some(edge),
        }
    }

    pub const fn info(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            edge: None,
        }
    }
}

/// Static declaration of what a handler may write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityModification {
    pub entity_name: String,
    pub event_type: TriggerType,
    pub fields: Vec<String>,
}

impl EntityModification {
    pub fn new(entity_name: &str, event_type: TriggerType, fields: &[&str]) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            event_type,
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: i64, available: i64 },

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("inventory invariant violated: {0}")]
    Invariant(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ActionError {
    /// Permanent errors cannot succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ActionError::Config(_) | ActionError::Unsupported(_) | ActionError::Invariant(_)
        )
    }
}

impl From<DomainError> for ActionError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InsufficientQuantity { requested, available } => {
                ActionError::InsufficientStock { requested, available }
            }
            DomainError::InvariantViolation(msg) => ActionError::Invariant(msg),
            DomainError::Validation(msg) => ActionError::Unsupported(msg),
            DomainError::InvalidId(msg) => ActionError::UnresolvedReference(msg),
        }
    }
}

pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Check that `config` belongs to this handler and is semantically valid.
    fn validate(&self, config: &ActionConfig) -> Result<(), ConfigError> {
        if config.action_type() != self.action_type() {
            return Err(ConfigError::WrongHandler {
                handler: self.action_type().to_string(),
                found: config.action_type().to_string(),
            });
        }
        config.validate()
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError>;

    fn entity_modifications(&self, config: &ActionConfig) -> Vec<EntityModification>;

    fn output_ports(&self) -> Vec<OutputPort> {
        Vec::new()
    }

    fn supports_manual_execution(&self) -> bool {
        false
    }

    fn is_async(&self) -> bool {
        false
    }

    /// Edge to follow after exiting through `outcome.port`.
    fn next_edge(&self, outcome: &ActionOutcome) -> EdgeType {
        self.output_ports()
            .into_iter()
            .find(|p| p.name == outcome.port)
            .and_then(|p| p.edge)
            .unwrap_or(EdgeType::Sequential)
    }
}

impl<H> ActionHandler for Arc<H>
where
    H: ActionHandler + ?Sized,
{
    fn action_type(&self) -> &'static str {
        (**self).action_type()
    }

    fn description(&self) -> &'static str {
        (**self).description()
    }

    fn validate(&self, config: &ActionConfig) -> Result<(), ConfigError> {
        (**self).validate(config)
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        (**self).execute(config, ctx)
    }

    fn entity_modifications(&self, config: &ActionConfig) -> Vec<EntityModification> {
        (**self).entity_modifications(config)
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        (**self).output_ports()
    }

    fn supports_manual_execution(&self) -> bool {
        (**self).supports_manual_execution()
    }

    fn is_async(&self) -> bool {
        (**self).is_async()
    }

    fn next_edge(&self, outcome: &ActionOutcome) -> EdgeType {
        (**self).next_edge(outcome)
    }
}

/// Discovery metadata for one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerDescriptor {
    pub action_type: &'static str,
    pub description: &'static str,
    pub output_ports: Vec<OutputPort>,
    pub supports_manual_execution: bool,
    pub is_async: bool,
}

/// Handlers by action type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, returning any handler it replaced.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Option<Arc<dyn ActionHandler>> {
        let action_type = handler.action_type();
        let replaced = self.handlers.insert(action_type, handler);
        if replaced.is_some() {
            tracing::warn!(action_type, "handler replaced in registry");
        }
        replaced
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve and validate an action's effective config against its handler.
    pub fn validate(&self, action: &RuleAction, template: Option<&ActionTemplate>) -> Result<ActionConfig, ConfigError> {
        let handler = self
            .get(&action.action_type)
            .ok_or_else(|| ConfigError::UnknownActionType(action.action_type.clone()))?;
        let config = ActionConfig::resolve(action, template)?;
        handler.validate(&config)?;
        Ok(config)
    }

    pub fn describe(&self) -> Vec<HandlerDescriptor> {
        self.handlers
            .values()
            .map(|h| HandlerDescriptor {
                action_type: h.action_type(),
                description: h.description(),
                output_ports: h.output_ports(),
                supports_manual_execution: h.supports_manual_execution(),
                is_async: h.is_async(),
            })
            .collect()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::action_types;
    use serde_json::json;
    use stockflow_core::ProductId;

    struct Probe;

    impl ActionHandler for Probe {
        fn action_type(&self) -> &'static str {
            action_types::CHECK_INVENTORY
        }

        fn execute(&self, _config: &ActionConfig, _ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::new("sufficient", json!({})))
        }

        fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
            Vec::new()
        }

        fn output_ports(&self) -> Vec<OutputPort> {
            vec![
                OutputPort::branch("sufficient", "enough stock", EdgeType::TrueBranch),
                OutputPort::branch("insufficient", "not enough stock", EdgeType::FalseBranch),
                OutputPort::info("noted", "informational"),
            ]
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Probe));
        registry
    }

    #[test]
    fn ports_map_to_edges() {
        assert_eq!(Probe.next_edge(&ActionOutcome::new("sufficient", json!(null))), EdgeType::TrueBranch);
        assert_eq!(Probe.next_edge(&ActionOutcome::new("insufficient", json!(null))), EdgeType::FalseBranch);
        assert_eq!(Probe.next_edge(&ActionOutcome::new("noted", json!(null))), EdgeType::Sequential);
        assert_eq!(Probe.next_edge(&ActionOutcome::new("other", json!(null))), EdgeType::Sequential);
    }

    #[test]
    fn registry_validates_through_handler() {
        let registry = registry();
        let rule = RuleId::new();
        let ok = RuleAction::new(
            rule,
            "check",
            action_types::CHECK_INVENTORY,
            json!({ "product_id": ProductId::new().to_string(), "threshold": 1 }),
        );
        assert!(registry.validate(&ok, None).is_ok());

        let unregistered = RuleAction::new(rule, "reserve", action_types::RESERVE_INVENTORY, json!({}));
        assert_eq!(
            registry.validate(&unregistered, None).unwrap_err(),
            ConfigError::UnknownActionType("reserve_inventory".into())
        );
    }

    #[test]
    fn handler_rejects_foreign_config() {
        let config = ActionConfig::parse(
            action_types::COMMIT_ALLOCATION,
            &json!({
                "product_id": ProductId::new().to_string(),
                "location_id": stockflow_core::LocationId::new().to_string(),
                "quantity": 1
            }),
        )
        .unwrap();
        assert!(matches!(Probe.validate(&config), Err(ConfigError::WrongHandler { .. })));
    }

    #[test]
    fn step_contexts_have_distinct_stable_keys() {
        let ctx = ExecutionContext::manual("orders", EntityId::new(), Map::new(), UserId::new());
        let (a, b) = (ActionId::new(), ActionId::new());
        let key = |id| ctx.for_step(id).idempotency_key("reserve_inventory");
        assert_eq!(key(a), key(a));
        assert_ne!(key(a), key(b));
        assert!(key(a).as_str().contains("_manual_"));
    }

    #[test]
    fn permanent_errors() {
        assert!(ActionError::Config(ConfigError::UnknownActionType("x".into())).is_permanent());
        assert!(!ActionError::InsufficientStock { requested: 2, available: 1 }.is_permanent());
        assert!(!ActionError::Storage("down".into()).is_permanent());
        assert_eq!(
            ActionError::from(DomainError::insufficient(5, 3)),
            ActionError::InsufficientStock { requested: 5, available: 3 }
        );
    }

    #[test]
    fn describe_lists_handlers() {
        let descriptors = registry().describe();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].action_type, "check_inventory");
        assert_eq!(descriptors[0].output_ports.len(), 3);
    }
}
