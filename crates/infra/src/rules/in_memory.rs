use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use stockflow_automation::{ActionEdge, ActionTemplate, AutomationRule, RuleAction};
use stockflow_core::{RuleId, TemplateId};

use super::{RuleStore, RuleStoreError};

#[derive(Debug, Default)]
struct Tables {
    rules: HashMap<RuleId, AutomationRule>,
    actions: Vec<RuleAction>,
    edges: Vec<ActionEdge>,
    templates: HashMap<TemplateId, ActionTemplate>,
}

/// Rule store kept in process memory; actions and edges keep insertion order.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    tables: RwLock<Tables>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RuleStoreError> {
        self.tables
            .read()
            .map_err(|_| RuleStoreError::Storage("rule store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RuleStoreError> {
        self.tables
            .write()
            .map_err(|_| RuleStoreError::Storage("rule store lock poisoned".into()))
    }
}

impl RuleStore for InMemoryRuleStore {
    fn list_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        let mut rules: Vec<_> = self.read()?.rules.values().cloned().collect();
        rules.sort_by_key(|r| (r.created_at, r.id));
        Ok(rules)
    }

    fn list_active_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        Ok(self.list_rules()?.into_iter().filter(|r| r.is_active).collect())
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>, RuleStoreError> {
        Ok(self.read()?.rules.get(&id).cloned())
    }

    fn insert_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        if tables.rules.contains_key(&rule.id) {
            return Err(RuleStoreError::AlreadyExists(format!("rule {}", rule.id)));
        }
        tables.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn update_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .rules
            .get_mut(&rule.id)
            .ok_or_else(|| RuleStoreError::rule_not_found(rule.id))?;
        *stored = rule.clone();
        Ok(())
    }

    fn delete_rule(&self, id: RuleId) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        tables.rules.remove(&id).ok_or_else(|| RuleStoreError::rule_not_found(id))?;
        tables.actions.retain(|a| a.rule_id != id);
        tables.edges.retain(|e| e.rule_id != id);
        Ok(())
    }

    fn insert_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        if !tables.rules.contains_key(&action.rule_id) {
            return Err(RuleStoreError::rule_not_found(action.rule_id));
        }
        if tables.actions.iter().any(|a| a.id == action.id) {
            return Err(RuleStoreError::AlreadyExists(format!("action {}", action.id)));
        }
        tables.actions.push(action.clone());
        Ok(())
    }

    fn update_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .actions
            .iter_mut()
            .find(|a| a.id == action.id)
            .ok_or_else(|| RuleStoreError::action_not_found(action.id))?;
        *stored = action.clone();
        Ok(())
    }

    fn actions_for_rule(&self, rule_id: RuleId) -> Result<Vec<RuleAction>, RuleStoreError> {
        Ok(self
            .read()?
            .actions
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect())
    }

    fn insert_edge(&self, edge: &ActionEdge) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        if !tables.rules.contains_key(&edge.rule_id) {
            return Err(RuleStoreError::rule_not_found(edge.rule_id));
        }
        tables.edges.push(edge.clone());
        Ok(())
    }

    fn edges_for_rule(&self, rule_id: RuleId) -> Result<Vec<ActionEdge>, RuleStoreError> {
        let mut edges: Vec<_> = self
            .read()?
            .edges
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.edge_order);
        Ok(edges)
    }

    fn insert_template(&self, template: &ActionTemplate) -> Result<(), RuleStoreError> {
        let mut tables = self.write()?;
        if tables.templates.contains_key(&template.id) {
            return Err(RuleStoreError::AlreadyExists(format!("template {}", template.id)));
        }
        tables.templates.insert(template.id, template.clone());
        Ok(())
    }

    fn get_template(&self, id: TemplateId) -> Result<Option<ActionTemplate>, RuleStoreError> {
        Ok(self.read()?.templates.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockflow_automation::EdgeType;
    use stockflow_core::UserId;
    use stockflow_events::TriggerType;

    fn rule() -> AutomationRule {
        AutomationRule::new("reserve on order", "sales_orders", TriggerType::OnCreate, UserId::new())
    }

    #[test]
    fn active_rules_exclude_inactive_ones() {
        let store = InMemoryRuleStore::new();
        let active = rule();
        let inactive = rule().inactive();
        store.insert_rule(&active).unwrap();
        store.insert_rule(&inactive).unwrap();

        let listed = store.list_active_rules().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
        assert_eq!(store.list_rules().unwrap().len(), 2);
        assert!(matches!(
            store.insert_rule(&active),
            Err(RuleStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn delete_cascades_to_actions_and_edges() {
        let store = InMemoryRuleStore::new();
        let (doomed, kept) = (rule(), rule());
        store.insert_rule(&doomed).unwrap();
        store.insert_rule(&kept).unwrap();

        for r in [&doomed, &kept] {
            let first = RuleAction::new(r.id, "check", "check_inventory", json!({}));
            let second = RuleAction::new(r.id, "reserve", "reserve_inventory", json!({}));
            store.insert_action(&first).unwrap();
            store.insert_action(&second).unwrap();
            store.insert_edge(&ActionEdge::start(r.id, first.id)).unwrap();
            store
                .insert_edge(&ActionEdge::between(r.id, first.id, second.id, EdgeType::TrueBranch))
                .unwrap();
        }

        store.delete_rule(doomed.id).unwrap();

        assert!(store.get_rule(doomed.id).unwrap().is_none());
        assert!(store.actions_for_rule(doomed.id).unwrap().is_empty());
        assert!(store.edges_for_rule(doomed.id).unwrap().is_empty());
        assert_eq!(store.actions_for_rule(kept.id).unwrap().len(), 2);
        assert_eq!(store.edges_for_rule(kept.id).unwrap().len(), 2);
        assert_eq!(
            store.delete_rule(doomed.id),
            Err(RuleStoreError::rule_not_found(doomed.id))
        );
    }

    #[test]
    fn actions_require_an_existing_rule() {
        let store = InMemoryRuleStore::new();
        let orphan = RuleAction::new(RuleId::new(), "check", "check_inventory", json!({}));
        assert!(matches!(
            store.insert_action(&orphan),
            Err(RuleStoreError::NotFound(_))
        ));
    }
}
