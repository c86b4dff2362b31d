use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stockflow_core::{DomainError, EntityId, UserId};

/// Kind of mutation that produced a [`TriggerEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnCreate,
    OnUpdate,
    OnDelete,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::OnCreate => "on_create",
            TriggerType::OnUpdate => "on_update",
            TriggerType::OnDelete => "on_delete",
        }
    }
}

impl core::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TriggerType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_create" => Ok(TriggerType::OnCreate),
            "on_update" => Ok(TriggerType::OnUpdate),
            "on_delete" => Ok(TriggerType::OnDelete),
            other => Err(DomainError::validation(format!(
                "unknown trigger type: {other}"
            ))),
        }
    }
}

/// Before/after value of one field touched by an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: JsonValue,
    pub new: JsonValue,
}

/// An entity-change fact emitted after a business mutation commits.
///
/// Constructed once per mutation and never modified afterwards; it travels
/// unchanged from the delegate through rule matching into execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    event_type: TriggerType,
    entity_name: String,
    entity_id: EntityId,
    timestamp: DateTime<Utc>,
    raw_data: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    field_changes: BTreeMap<String, FieldChange>,
    user_id: UserId,
}

impl TriggerEvent {
    pub fn new(
        event_type: TriggerType,
        entity_name: impl Into<String>,
        entity_id: EntityId,
        raw_data: Map<String, JsonValue>,
        user_id: UserId,
    ) -> Self {
        Self {
            event_type,
            entity_name: entity_name.into(),
            entity_id,
            timestamp: Utc::now(),
            raw_data,
            field_changes: BTreeMap::new(),
            user_id,
        }
    }

    pub fn created(
        entity_name: impl Into<String>,
        entity_id: EntityId,
        raw_data: Map<String, JsonValue>,
        user_id: UserId,
    ) -> Self {
        Self::new(TriggerType::OnCreate, entity_name, entity_id, raw_data, user_id)
    }

    /// Update event; `field_changes` is derived by diffing `before` against `after`.
    pub fn updated(
        entity_name: impl Into<String>,
        entity_id: EntityId,
        before: &Map<String, JsonValue>,
        after: Map<String, JsonValue>,
        user_id: UserId,
    ) -> Self {
        let mut field_changes = BTreeMap::new();
        for (field, new) in &after {
            let old = before.get(field).cloned().unwrap_or(JsonValue::Null);
            if &old != new {
                field_changes.insert(
                    field.clone(),
                    FieldChange {
                        old,
                        new: new.clone(),
                    },
                );
            }
        }

        let mut event = Self::new(TriggerType::OnUpdate, entity_name, entity_id, after, user_id);
        event.field_changes = field_changes;
        event
    }

    pub fn deleted(
        entity_name: impl Into<String>,
        entity_id: EntityId,
        raw_data: Map<String, JsonValue>,
        user_id: UserId,
    ) -> Self {
        Self::new(TriggerType::OnDelete, entity_name, entity_id, raw_data, user_id)
    }

    /// Pin the business timestamp (tests, replays).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> TriggerType {
        self.event_type
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw_data(&self) -> &Map<String, JsonValue> {
        &self.raw_data
    }

    /// Field value from the mutated record's raw data.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.raw_data.get(name)
    }

    pub fn field_changes(&self) -> &BTreeMap<String, FieldChange> {
        &self.field_changes
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
