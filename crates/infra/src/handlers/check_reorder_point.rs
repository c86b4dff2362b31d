use std::sync::Arc;

use serde_json::json;

use stockflow_automation::config::action_types;
use stockflow_automation::{
    ActionConfig, ActionError, ActionHandler, ActionOutcome, EdgeType, EntityModification, ExecutionContext,
    OutputPort,
};

use super::check_inventory::{StockTotals, wrong_config};
use super::resolve_product;
use crate::ledger::{InventoryLedger, ItemQuery};

pub const NEEDS_REORDER: &str = "needs_reorder";
pub const STOCK_OK: &str = "stock_ok";

/// Compare available stock against the reorder point.
///
/// The reorder point is `custom_threshold` when configured, otherwise the
/// highest `reorder_point` among matched rows. Stock at or below it needs
/// reordering; the suggested quantity refills up to the highest
/// `maximum_stock`.
pub struct CheckReorderPointHandler {
    ledger: Arc<dyn InventoryLedger>,
}

impl CheckReorderPointHandler {
    pub fn new(ledger: Arc<dyn InventoryLedger>) -> Self {
        Self { ledger }
    }
}

impl ActionHandler for CheckReorderPointHandler {
    fn action_type(&self) -> &'static str {
        action_types::CHECK_REORDER_POINT
    }

    fn description(&self) -> &'static str {
        "Check whether available stock has fallen to the reorder point"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::CheckReorderPoint(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };
        let product_id = resolve_product(c.product_id, c.source_from_line_item, ctx)?;
        let items = self
            .ledger
            .find_items(&ItemQuery::scoped(product_id, c.location_id, c.warehouse_id))?;
        let totals = StockTotals::of(&items);
        let available = totals.available();
        let reorder_point = c.custom_threshold.unwrap_or(totals.max_reorder_point);
        let needs_reorder = available <= reorder_point;
        let suggested_quantity = if needs_reorder {
            totals.max_stock.saturating_sub(available).max(0)
        } else {
            0
        };

        Ok(ActionOutcome::new(
            if needs_reorder { NEEDS_REORDER } else { STOCK_OK },
            json!({
                "product_id": product_id,
                "rows": totals.rows,
                "available": available,
                "reorder_point": reorder_point,
                "needs_reorder": needs_reorder,
                "suggested_quantity": suggested_quantity,
            }),
        ))
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![
            OutputPort::branch(NEEDS_REORDER, "Available stock is at or below the reorder point", EdgeType::TrueBranch),
            OutputPort::branch(STOCK_OK, "Available stock is above the reorder point", EdgeType::FalseBranch),
        ]
    }

    fn supports_manual_execution(&self) -> bool {
        true
    }
}
