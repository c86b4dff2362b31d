use std::sync::Arc;

use serde_json::json;

use stockflow_automation::config::action_types;
use stockflow_automation::{
    ActionConfig, ActionError, ActionHandler, ActionOutcome, ConfigError, EdgeType, EntityModification,
    ExecutionContext, OutputPort,
};
use stockflow_inventory::InventoryItem;

use super::resolve_product;
use crate::ledger::{InventoryLedger, ItemQuery};

pub const SUFFICIENT: &str = "sufficient";
pub const INSUFFICIENT: &str = "insufficient";

/// Sums over every matched row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StockTotals {
    pub rows: usize,
    pub quantity: i64,
    pub reserved: i64,
    pub allocated: i64,
    available: i64,
    pub max_reorder_point: i64,
    pub max_stock: i64,
}

impl StockTotals {
    /// Sums saturate at `i64::MAX` rather than wrapping.
    pub fn of(items: &[InventoryItem]) -> Self {
        items.iter().fold(Self::default(), |acc, item| Self {
            rows: acc.rows + 1,
            quantity: acc.quantity.saturating_add(item.quantity()),
            reserved: acc.reserved.saturating_add(item.reserved_quantity()),
            allocated: acc.allocated.saturating_add(item.allocated_quantity()),
            available: acc.available.saturating_add(item.available()),
            max_reorder_point: acc.max_reorder_point.max(item.levels.reorder_point),
            max_stock: acc.max_stock.max(item.levels.maximum_stock),
        })
    }

    pub fn available(&self) -> i64 {
        self.available
    }
}

/// Compare available stock against a threshold without locking anything.
pub struct CheckInventoryHandler {
    ledger: Arc<dyn InventoryLedger>,
}

impl CheckInventoryHandler {
    pub fn new(ledger: Arc<dyn InventoryLedger>) -> Self {
        Self { ledger }
    }
}

impl ActionHandler for CheckInventoryHandler {
    fn action_type(&self) -> &'static str {
        action_types::CHECK_INVENTORY
    }

    fn description(&self) -> &'static str {
        "Check whether available stock meets a threshold"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::CheckInventory(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };
        let product_id = resolve_product(c.product_id, c.source_from_line_item, ctx)?;
        let items = self
            .ledger
            .find_items(&ItemQuery::scoped(product_id, c.location_id, c.warehouse_id))?;
        let totals = StockTotals::of(&items);
        let available = totals.available();
        let sufficient = available >= c.threshold;

        Ok(ActionOutcome::new(
            if sufficient { SUFFICIENT } else { INSUFFICIENT },
            json!({
                "product_id": product_id,
                "rows": totals.rows,
                "quantity": totals.quantity,
                "reserved_quantity": totals.reserved,
                "allocated_quantity": totals.allocated,
                "available": available,
                "threshold": c.threshold,
                "sufficient": sufficient,
            }),
        ))
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![
            OutputPort::branch(SUFFICIENT, "Available stock meets the threshold", EdgeType::TrueBranch),
            OutputPort::branch(INSUFFICIENT, "Available stock is below the threshold", EdgeType::FalseBranch),
        ]
    }

    fn supports_manual_execution(&self) -> bool {
        true
    }
}

pub(crate) fn wrong_config(handler: &str, config: &ActionConfig) -> ActionError {
    ActionError::Config(ConfigError::WrongHandler {
        handler: handler.to_string(),
        found: config.action_type().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{Fixture, config, ctx, ctx_with};
    use serde_json::Map;
    use stockflow_core::{LocationId, WarehouseId};

    fn check(fx: &Fixture, threshold: i64, extra: serde_json::Value) -> ActionOutcome {
        let mut value = json!({ "product_id": fx.product.to_string(), "threshold": threshold });
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        CheckInventoryHandler::new(fx.ledger.clone())
            .execute(&config(action_types::CHECK_INVENTORY, value), &ctx())
            .unwrap()
    }

    #[test]
    fn sums_rows_and_branches_on_threshold() {
        let fx = Fixture::new();
        fx.row(LocationId::new(), 10, 3, 2);
        fx.row(LocationId::new(), 8, 0, 1);

        let out = check(&fx, 12, json!({}));
        assert_eq!(out.port, SUFFICIENT);
        assert_eq!(out.data["available"], 12);
        assert_eq!(out.data["rows"], 2);

        assert_eq!(check(&fx, 13, json!({})).port, INSUFFICIENT);
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let fx = Fixture::new();
        fx.row(LocationId::new(), i64::MAX, 0, 0);
        fx.row(LocationId::new(), i64::MAX, 0, 0);

        let out = check(&fx, 1_000, json!({}));
        assert_eq!(out.port, SUFFICIENT);
        assert_eq!(out.data["available"], i64::MAX);
        assert_eq!(out.data["quantity"], i64::MAX);
    }

    #[test]
    fn location_and_warehouse_scope() {
        let fx = Fixture::new();
        let (a, b) = (LocationId::new(), LocationId::new());
        let warehouse = WarehouseId::new();
        fx.ledger.assign_location(a, warehouse).unwrap();
        fx.row(a, 4, 0, 0);
        fx.row(b, 20, 0, 0);

        let at_a = check(&fx, 0, json!({ "location_id": a.to_string() }));
        assert_eq!(at_a.data["available"], 4);
        let in_warehouse = check(&fx, 0, json!({ "warehouse_id": warehouse.to_string() }));
        assert_eq!(in_warehouse.data["available"], 4);
    }

    #[test]
    fn product_can_come_from_the_line_item() {
        let fx = Fixture::new();
        fx.row(LocationId::new(), 5, 0, 0);
        let mut raw = Map::new();
        raw.insert("product_id".into(), json!(fx.product.to_string()));

        let handler = CheckInventoryHandler::new(fx.ledger.clone());
        let cfg = config(
            action_types::CHECK_INVENTORY,
            json!({ "source_from_line_item": true, "threshold": 5 }),
        );
        assert_eq!(handler.execute(&cfg, &ctx_with(raw)).unwrap().port, SUFFICIENT);

        let err = handler.execute(&cfg, &ctx()).unwrap_err();
        assert!(matches!(err, ActionError::UnresolvedReference(_)));
    }

    #[test]
    fn no_rows_means_nothing_available() {
        let fx = Fixture::new();
        let out = check(&fx, 1, json!({}));
        assert_eq!(out.port, INSUFFICIENT);
        assert_eq!(out.data["available"], 0);
    }
}
