//! Postgres-backed rule store.
//!
//! ## Tables
//!
//! | table | role |
//! |-------|------|
//! | `automation_rules` | rule header; `trigger_conditions` is JSONB |
//! | `rule_actions` | graph nodes, `action_config` JSONB overrides |
//! | `action_edges` | graph edges; `source_action_id` is NULL for the start edge |
//! | `action_templates` | reusable default configs |
//!
//! Deleting a rule removes its edges, actions and the rule row in one
//! transaction.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use stockflow_automation::{ActionEdge, ActionTemplate, AutomationRule, EdgeType, RuleAction, TriggerConditions};
use stockflow_core::{ActionId, RuleId, TemplateId, UserId};
use stockflow_events::TriggerType;

use super::{RuleStore, RuleStoreError};

const RULE_COLUMNS: &str = r#"
    id, name, description, entity_name, trigger_type, trigger_conditions,
    is_active, created_by, created_at
"#;

const ACTION_COLUMNS: &str = r#"
    id, automation_rule_id, name, action_type, template_id, action_config, is_active
"#;

#[derive(Debug, Clone)]
pub struct PostgresRuleStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresRuleStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn load_rules(&self, active_only: bool) -> Result<Vec<AutomationRule>, RuleStoreError> {
        let sql = format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM automation_rules
            WHERE NOT $1 OR is_active
            ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(active_only)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_rules", e))?;
        rows.iter().map(rule_from_row).collect()
    }

    #[instrument(skip(self), fields(rule_id = %id), err)]
    pub async fn load_rule(&self, id: RuleId) -> Result<Option<AutomationRule>, RuleStoreError> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_rule", e))?;
        row.as_ref().map(rule_from_row).transpose()
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.id), err)]
    pub async fn save_rule(&self, rule: &AutomationRule, insert: bool) -> Result<(), RuleStoreError> {
        let conditions = rule
            .conditions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RuleStoreError::Serialization(e.to_string()))?;

        let sql = if insert {
            r#"
            INSERT INTO automation_rules
                (id, name, description, entity_name, trigger_type, trigger_conditions,
                 is_active, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#
        } else {
            r#"
            UPDATE automation_rules
            SET name = $2, description = $3, entity_name = $4, trigger_type = $5,
                trigger_conditions = $6, is_active = $7, updated_at = NOW()
            WHERE id = $1
            "#
        };

        let mut query = sqlx::query(sql)
            .bind(rule.id.as_uuid())
            .bind(&rule.name)
            .bind(&rule.description)
            .bind(&rule.entity_name)
            .bind(rule.trigger_type.as_str())
            .bind(conditions)
            .bind(rule.is_active);
        if insert {
            query = query.bind(rule.created_by.as_uuid()).bind(rule.created_at);
        }

        let result = query.execute(&*self.pool).await.map_err(|e| {
            if insert && crate::ledger::postgres::is_unique_violation(&e) {
                RuleStoreError::AlreadyExists(format!("rule {}", rule.id))
            } else {
                map_sqlx_error("save_rule", e)
            }
        })?;
        if !insert && result.rows_affected() == 0 {
            return Err(RuleStoreError::rule_not_found(rule.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(rule_id = %id), err)]
    pub async fn remove_rule(&self, id: RuleId) -> Result<(), RuleStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for sql in [
            "DELETE FROM action_edges WHERE rule_id = $1",
            "DELETE FROM rule_actions WHERE automation_rule_id = $1",
        ] {
            sqlx::query(sql)
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_rule_children", e))?;
        }

        let deleted = sqlx::query("DELETE FROM automation_rules WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_rule", e))?;
        if deleted.rows_affected() == 0 {
            return Err(RuleStoreError::rule_not_found(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, action), fields(action_id = %action.id, rule_id = %action.rule_id), err)]
    pub async fn save_action(&self, action: &RuleAction, insert: bool) -> Result<(), RuleStoreError> {
        let sql = if insert {
            r#"
            INSERT INTO rule_actions
                (id, automation_rule_id, name, action_type, template_id, action_config, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        } else {
            r#"
            UPDATE rule_actions
            SET automation_rule_id = $2, name = $3, action_type = $4, template_id = $5,
                action_config = $6, is_active = $7
            WHERE id = $1
            "#
        };
        let result = sqlx::query(sql)
            .bind(action.id.as_uuid())
            .bind(action.rule_id.as_uuid())
            .bind(&action.name)
            .bind(&action.action_type)
            .bind(action.template_id.map(Uuid::from))
            .bind(&action.config)
            .bind(action.is_active)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_action", e))?;
        if !insert && result.rows_affected() == 0 {
            return Err(RuleStoreError::action_not_found(action.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn load_actions(&self, rule_id: RuleId) -> Result<Vec<RuleAction>, RuleStoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM rule_actions WHERE automation_rule_id = $1 ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(rule_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_actions", e))?;
        rows.iter().map(action_from_row).collect()
    }

    #[instrument(skip(self, edge), fields(rule_id = %edge.rule_id, edge_type = %edge.edge_type), err)]
    pub async fn save_edge(&self, edge: &ActionEdge) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            INSERT INTO action_edges
                (rule_id, source_action_id, target_action_id, edge_type, edge_order)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(edge.rule_id.as_uuid())
        .bind(edge.source_action_id.map(Uuid::from))
        .bind(edge.target_action_id.as_uuid())
        .bind(edge.edge_type.as_str())
        .bind(edge.edge_order)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_edge", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn load_edges(&self, rule_id: RuleId) -> Result<Vec<ActionEdge>, RuleStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT rule_id, source_action_id, target_action_id, edge_type, edge_order
            FROM action_edges
            WHERE rule_id = $1
            ORDER BY edge_order ASC
            "#,
        )
        .bind(rule_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_edges", e))?;
        rows.iter().map(edge_from_row).collect()
    }

    #[instrument(skip(self, template), fields(template_id = %template.id), err)]
    pub async fn save_template(&self, template: &ActionTemplate) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            INSERT INTO action_templates (id, name, action_type, default_config, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(template.id.as_uuid())
        .bind(&template.name)
        .bind(&template.action_type)
        .bind(&template.default_config)
        .bind(template.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if crate::ledger::postgres::is_unique_violation(&e) {
                RuleStoreError::AlreadyExists(format!("template {}", template.id))
            } else {
                map_sqlx_error("save_template", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(template_id = %id), err)]
    pub async fn load_template(&self, id: TemplateId) -> Result<Option<ActionTemplate>, RuleStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, action_type, default_config, created_at
            FROM action_templates
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_template", e))?;

        row.map(|row| -> Result<ActionTemplate, RuleStoreError> {
            Ok(ActionTemplate {
                id: TemplateId::from_uuid(get(&row, "id")?),
                name: get(&row, "name")?,
                action_type: get(&row, "action_type")?,
                default_config: get(&row, "default_config")?,
                created_at: get(&row, "created_at")?,
            })
        })
        .transpose()
    }
}

impl RuleStore for PostgresRuleStore {
    fn list_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        self.handle.block_on(self.load_rules(false))
    }

    fn list_active_rules(&self) -> Result<Vec<AutomationRule>, RuleStoreError> {
        self.handle.block_on(self.load_rules(true))
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<AutomationRule>, RuleStoreError> {
        self.handle.block_on(self.load_rule(id))
    }

    fn insert_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_rule(rule, true))
    }

    fn update_rule(&self, rule: &AutomationRule) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_rule(rule, false))
    }

    fn delete_rule(&self, id: RuleId) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.remove_rule(id))
    }

    fn insert_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_action(action, true))
    }

    fn update_action(&self, action: &RuleAction) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_action(action, false))
    }

    fn actions_for_rule(&self, rule_id: RuleId) -> Result<Vec<RuleAction>, RuleStoreError> {
        self.handle.block_on(self.load_actions(rule_id))
    }

    fn insert_edge(&self, edge: &ActionEdge) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_edge(edge))
    }

    fn edges_for_rule(&self, rule_id: RuleId) -> Result<Vec<ActionEdge>, RuleStoreError> {
        self.handle.block_on(self.load_edges(rule_id))
    }

    fn insert_template(&self, template: &ActionTemplate) -> Result<(), RuleStoreError> {
        self.handle.block_on(self.save_template(template))
    }

    fn get_template(&self, id: TemplateId) -> Result<Option<ActionTemplate>, RuleStoreError> {
        self.handle.block_on(self.load_template(id))
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, RuleStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| RuleStoreError::Serialization(format!("column {column}: {e}")))
}

fn rule_from_row(row: &PgRow) -> Result<AutomationRule, RuleStoreError> {
    let trigger_type: String = get(row, "trigger_type")?;
    let conditions: Option<serde_json::Value> = get(row, "trigger_conditions")?;
    Ok(AutomationRule {
        id: RuleId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        description: get(row, "description")?,
        entity_name: get(row, "entity_name")?,
        trigger_type: trigger_type
            .parse::<TriggerType>()
            .map_err(|e| RuleStoreError::Serialization(e.to_string()))?,
        conditions: conditions
            .map(serde_json::from_value::<TriggerConditions>)
            .transpose()
            .map_err(|e| RuleStoreError::Serialization(e.to_string()))?,
        is_active: get(row, "is_active")?,
        created_by: UserId::from_uuid(get(row, "created_by")?),
        created_at: get(row, "created_at")?,
    })
}

fn action_from_row(row: &PgRow) -> Result<RuleAction, RuleStoreError> {
    let template_id: Option<Uuid> = get(row, "template_id")?;
    Ok(RuleAction {
        id: ActionId::from_uuid(get(row, "id")?),
        rule_id: RuleId::from_uuid(get(row, "automation_rule_id")?),
        name: get(row, "name")?,
        action_type: get(row, "action_type")?,
        template_id: template_id.map(TemplateId::from_uuid),
        config: get(row, "action_config")?,
        is_active: get(row, "is_active")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<ActionEdge, RuleStoreError> {
    let source: Option<Uuid> = get(row, "source_action_id")?;
    let edge_type: String = get(row, "edge_type")?;
    Ok(ActionEdge {
        rule_id: RuleId::from_uuid(get(row, "rule_id")?),
        source_action_id: source.map(ActionId::from_uuid),
        target_action_id: ActionId::from_uuid(get(row, "target_action_id")?),
        edge_type: edge_type
            .parse::<EdgeType>()
            .map_err(|e| RuleStoreError::Serialization(e.to_string()))?,
        edge_order: get(row, "edge_order")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RuleStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            RuleStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RuleStoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => RuleStoreError::Storage(format!("{operation}: {other}")),
    }
}
