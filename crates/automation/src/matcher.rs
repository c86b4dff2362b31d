use std::collections::HashMap;

use chrono::{DateTime, Utc};

use stockflow_events::{TriggerEvent, TriggerType};

use crate::rule::AutomationRule;

/// Immutable index of active rules keyed by (entity name, trigger type).
///
/// Matching never touches storage; a new snapshot replaces this one wholesale
/// when rules change.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    by_key: HashMap<(String, TriggerType), Vec<AutomationRule>>,
    loaded_at: DateTime<Utc>,
    len: usize,
}

impl RuleSnapshot {
    /// Index `rules`, discarding inactive ones.
    pub fn build(rules: impl IntoIterator<Item = AutomationRule>) -> Self {
        let mut by_key: HashMap<(String, TriggerType), Vec<AutomationRule>> = HashMap::new();
        let mut len = 0;
        for rule in rules.into_iter().filter(|r| r.is_active) {
            by_key
                .entry((rule.entity_name.clone(), rule.trigger_type))
                .or_default()
                .push(rule);
            len += 1;
        }
        // Deterministic dispatch order.
        for bucket in by_key.values_mut() {
            bucket.sort_by_key(|r| (r.created_at, r.id));
        }
        Self {
            by_key,
            loaded_at: Utc::now(),
            len,
        }
    }

    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Active rules whose entity, trigger type and conditions accept `event`.
    pub fn matching(&self, event: &TriggerEvent) -> Vec<AutomationRule> {
        self.by_key
            .get(&(event.entity_name().to_string(), event.event_type()))
            .map(|bucket| bucket.iter().filter(|r| r.matches(event)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl Default for RuleSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionOperator, FieldCondition, TriggerConditions};
    use chrono::Duration;
    use serde_json::{Map, json};
    use stockflow_core::{EntityId, UserId};

    fn order_created(status: &str) -> TriggerEvent {
        let mut data = Map::new();
        data.insert("status".into(), json!(status));
        TriggerEvent::created("orders", EntityId::new(), data, UserId::new())
    }

    #[test]
    fn unmatched_event_yields_empty_list() {
        let snapshot = RuleSnapshot::build(vec![AutomationRule::new(
            "r",
            "customers",
            TriggerType::OnCreate,
            UserId::new(),
        )]);
        assert!(snapshot.matching(&order_created("open")).is_empty());
    }

    #[test]
    fn conditions_filter_within_bucket() {
        let always = AutomationRule::new("always", "orders", TriggerType::OnCreate, UserId::new());
        let only_held = AutomationRule::new("held", "orders", TriggerType::OnCreate, UserId::new())
            .with_conditions(TriggerConditions::new(vec![FieldCondition::new(
                "status",
                ConditionOperator::Equals,
                json!("held"),
            )]));
        let snapshot = RuleSnapshot::build(vec![always.clone(), only_held.clone()]);

        let open: Vec<_> = snapshot.matching(&order_created("open")).into_iter().map(|r| r.id).collect();
        assert_eq!(open, vec![always.id]);
        assert_eq!(snapshot.matching(&order_created("held")).len(), 2);
    }

    #[test]
    fn inactive_rules_are_not_indexed() {
        let snapshot = RuleSnapshot::build(vec![
            AutomationRule::new("off", "orders", TriggerType::OnCreate, UserId::new()).inactive(),
        ]);
        assert!(snapshot.is_empty());
        assert!(snapshot.matching(&order_created("open")).is_empty());
    }

    #[test]
    fn matches_are_ordered_by_creation() {
        let mut later = AutomationRule::new("later", "orders", TriggerType::OnCreate, UserId::new());
        let earlier = AutomationRule::new("earlier", "orders", TriggerType::OnCreate, UserId::new());
        later.created_at = earlier.created_at + Duration::seconds(5);

        let snapshot = RuleSnapshot::build(vec![later.clone(), earlier.clone()]);
        let names: Vec<_> = snapshot
            .matching(&order_created("open"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["earlier", "later"]);
    }
}
