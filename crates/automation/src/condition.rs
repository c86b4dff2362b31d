//! Structured trigger predicates over an event's payload.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockflow_core::{DomainError, DomainResult};
use stockflow_events::TriggerEvent;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    In,
    IsNull,
    /// Field was updated away from `value`.
    ChangedFrom,
    /// Field was updated to `value`.
    ChangedTo,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::Contains => "contains",
            ConditionOperator::In => "in",
            ConditionOperator::IsNull => "is_null",
            ConditionOperator::ChangedFrom => "changed_from",
            ConditionOperator::ChangedTo => "changed_to",
        }
    }

    fn requires_value(&self) -> bool {
        !matches!(self, ConditionOperator::IsNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field_name: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl FieldCondition {
    pub fn new(field_name: impl Into<String>, operator: ConditionOperator, value: JsonValue) -> Self {
        Self {
            field_name: field_name.into(),
            operator,
            value: Some(value),
        }
    }

    pub fn is_null(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            operator: ConditionOperator::IsNull,
            value: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.field_name.trim().is_empty() {
            return Err(DomainError::validation("condition field_name cannot be empty"));
        }
        let value = match (&self.value, self.operator.requires_value()) {
            (None, true) => {
                return Err(DomainError::validation(format!(
                    "operator '{}' on field '{}' requires a value",
                    self.operator.as_str(),
                    self.field_name
                )));
            }
            (Some(v), _) => v,
            (None, false) => return Ok(()),
        };
        match self.operator {
            ConditionOperator::In if !value.is_array() => Err(DomainError::validation(format!(
                "operator 'in' on field '{}' requires an array value",
                self.field_name
            ))),
            ConditionOperator::GreaterThan | ConditionOperator::LessThan
                if !(value.is_number() || value.is_string()) =>
            {
                Err(DomainError::validation(format!(
                    "operator '{}' on field '{}' requires a number or string",
                    self.operator.as_str(),
                    self.field_name
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn evaluate(&self, event: &TriggerEvent) -> bool {
        let actual = event.field(&self.field_name);
        let expected = self.value.as_ref();

        match self.operator {
            ConditionOperator::IsNull => actual.is_none_or(JsonValue::is_null),
            ConditionOperator::Equals => matches!((actual, expected), (Some(a), Some(e)) if json_eq(a, e)),
            ConditionOperator::NotEquals => match (actual, expected) {
                (Some(a), Some(e)) => !json_eq(a, e),
                (None, Some(e)) => !e.is_null(),
                _ => false,
            },
            ConditionOperator::GreaterThan => {
                compare(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                compare(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Less)
            }
            ConditionOperator::Contains => match (actual, expected) {
                (Some(JsonValue::String(s)), Some(JsonValue::String(needle))) => s.contains(needle.as_str()),
                (Some(JsonValue::Array(items)), Some(e)) => items.iter().any(|i| json_eq(i, e)),
                _ => false,
            },
            ConditionOperator::In => match (actual, expected) {
                (Some(a), Some(JsonValue::Array(options))) => options.iter().any(|o| json_eq(a, o)),
                _ => false,
            },
            ConditionOperator::ChangedFrom => match (event.field_changes().get(&self.field_name), expected) {
                (Some(change), Some(e)) => json_eq(&change.old, e) && !json_eq(&change.new, e),
                _ => false,
            },
            ConditionOperator::ChangedTo => match (event.field_changes().get(&self.field_name), expected) {
                (Some(change), Some(e)) => json_eq(&change.new, e) && !json_eq(&change.old, e),
                _ => false,
            },
        }
    }
}

/// Conjunction of field conditions; an empty set always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default)]
    pub field_conditions: Vec<FieldCondition>,
}

impl TriggerConditions {
    pub fn new(field_conditions: Vec<FieldCondition>) -> Self {
        Self { field_conditions }
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.field_conditions.iter().try_for_each(FieldCondition::validate)
    }

    pub fn evaluate(&self, event: &TriggerEvent) -> bool {
        self.field_conditions.iter().all(|c| c.evaluate(event))
    }
}

// Numbers compare by value so `5` and `5.0` are equal.
fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&JsonValue>, expected: Option<&JsonValue>) -> Option<std::cmp::Ordering> {
    match (actual?, expected?) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use stockflow_core::{EntityId, UserId};

    fn event(data: JsonValue) -> TriggerEvent {
        let map: Map<String, JsonValue> = data.as_object().cloned().unwrap_or_default();
        TriggerEvent::created("orders", EntityId::new(), map, UserId::new())
    }

    fn updated(before: JsonValue, after: JsonValue) -> TriggerEvent {
        TriggerEvent::updated(
            "orders",
            EntityId::new(),
            before.as_object().unwrap(),
            after.as_object().cloned().unwrap(),
            UserId::new(),
        )
    }

    #[test]
    fn equality_treats_integer_and_float_alike() {
        let c = FieldCondition::new("total", ConditionOperator::Equals, json!(5.0));
        assert!(c.evaluate(&event(json!({"total": 5}))));
        assert!(!c.evaluate(&event(json!({"total": 6}))));
    }

    #[test]
    fn ordering_operators_on_numbers_and_strings() {
        let gt = FieldCondition::new("total", ConditionOperator::GreaterThan, json!(100));
        let lt = FieldCondition::new("due", ConditionOperator::LessThan, json!("2025-01-01"));
        assert!(gt.evaluate(&event(json!({"total": 150}))));
        assert!(!gt.evaluate(&event(json!({"total": "150"}))));
        assert!(lt.evaluate(&event(json!({"due": "2024-12-31"}))));
    }

    #[test]
    fn contains_and_in() {
        let contains = FieldCondition::new("tags", ConditionOperator::Contains, json!("rush"));
        let within = FieldCondition::new("status", ConditionOperator::In, json!(["open", "held"]));
        assert!(contains.evaluate(&event(json!({"tags": ["rush", "gift"]}))));
        assert!(within.evaluate(&event(json!({"status": "held"}))));
        assert!(!within.evaluate(&event(json!({"status": "closed"}))));
    }

    #[test]
    fn missing_field_is_null() {
        let c = FieldCondition::is_null("notes");
        assert!(c.evaluate(&event(json!({}))));
        assert!(c.evaluate(&event(json!({"notes": null}))));
        assert!(!c.evaluate(&event(json!({"notes": "x"}))));
    }

    #[test]
    fn changed_to_requires_an_actual_change() {
        let c = FieldCondition::new("status", ConditionOperator::ChangedTo, json!("shipped"));
        assert!(c.evaluate(&updated(json!({"status": "open"}), json!({"status": "shipped"}))));
        assert!(!c.evaluate(&updated(json!({"status": "shipped"}), json!({"status": "shipped"}))));
        assert!(!c.evaluate(&event(json!({"status": "shipped"}))));
    }

    #[test]
    fn changed_from_matches_old_value() {
        let c = FieldCondition::new("status", ConditionOperator::ChangedFrom, json!("open"));
        assert!(c.evaluate(&updated(json!({"status": "open"}), json!({"status": "held"}))));
    }

    #[test]
    fn all_conditions_must_hold() {
        let conditions = TriggerConditions::new(vec![
            FieldCondition::new("status", ConditionOperator::Equals, json!("open")),
            FieldCondition::new("total", ConditionOperator::GreaterThan, json!(10)),
        ]);
        assert!(conditions.evaluate(&event(json!({"status": "open", "total": 20}))));
        assert!(!conditions.evaluate(&event(json!({"status": "open", "total": 5}))));
        assert!(TriggerConditions::default().evaluate(&event(json!({}))));
    }

    #[test]
    fn validation_rejects_malformed_conditions() {
        let missing_value = FieldCondition {
            field_name: "x".into(),
            operator: ConditionOperator::Equals,
            value: None,
        };
        assert!(missing_value.validate().is_err());
        assert!(FieldCondition::new("x", ConditionOperator::In, json!("a")).validate().is_err());
        assert!(FieldCondition::new("", ConditionOperator::Equals, json!(1)).validate().is_err());
        assert!(FieldCondition::is_null("x").validate().is_ok());
    }

    #[test]
    fn wire_shape() {
        let parsed: TriggerConditions = serde_json::from_value(json!({
            "field_conditions": [{"field_name": "status", "operator": "changed_to", "value": "paid"}]
        }))
        .unwrap();
        assert_eq!(parsed.field_conditions[0].operator, ConditionOperator::ChangedTo);
    }
}
