use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use stockflow_automation::config::action_types;
use stockflow_automation::{
    ActionConfig, ActionError, ActionHandler, ActionOutcome, EntityModification, ExecutionContext, OutputPort,
    ReceiveInventoryConfig,
};
use stockflow_core::{EntityId, ProductId, SupplierProductId};
use stockflow_events::TriggerType;
use stockflow_inventory::InventoryTransaction;

use super::check_inventory::wrong_config;
use super::{InventoryServices, line_item_quantity, run_idempotent};
use crate::ledger::ItemQuery;

pub const RECEIVED: &str = "received";
pub const ITEM_NOT_FOUND: &str = "item_not_found";
pub const FAILURE: &str = "failure";

/// Add on-hand stock at one location and write the inbound transaction.
///
/// Product and quantity come from config, or with `source_from_po` from a
/// purchase-order line item: the configured `po_line_item_id`, else the
/// triggering record's `supplier_product_id` and `quantity` fields, else the
/// triggering record itself looked up as a line item.
pub struct ReceiveInventoryHandler {
    services: InventoryServices,
}

enum Source {
    Resolved { product_id: ProductId, quantity: i64 },
    Unresolved(String),
}

impl ReceiveInventoryHandler {
    pub fn new(services: InventoryServices) -> Self {
        Self { services }
    }

    fn resolve(&self, c: &ReceiveInventoryConfig, ctx: &ExecutionContext) -> Result<Source, ActionError> {
        if !c.source_from_po {
            return match (c.product_id, c.quantity) {
                (Some(product_id), Some(quantity)) => Ok(Source::Resolved { product_id, quantity }),
                _ => Ok(Source::Unresolved("product_id and quantity are required".into())),
            };
        }

        let (supplier_product_id, line_quantity) = match self.po_line(c, ctx)? {
            Some(pair) => pair,
            None => return Ok(Source::Unresolved("purchase order line item not found".into())),
        };
        let Some(product_id) = self.services.references.supplier_product(supplier_product_id)? else {
            return Ok(Source::Unresolved(format!("supplier product {supplier_product_id} not found")));
        };
        match c.quantity.or(line_quantity).filter(|q| *q > 0) {
            Some(quantity) => Ok(Source::Resolved { product_id, quantity }),
            None => Ok(Source::Unresolved("purchase order line item has no quantity".into())),
        }
    }

    fn po_line(
        &self,
        c: &ReceiveInventoryConfig,
        ctx: &ExecutionContext,
    ) -> Result<Option<(SupplierProductId, Option<i64>)>, ActionError> {
        if let Some(id) = c.po_line_item_id {
            return self.lookup_line(id);
        }
        let from_event = ctx
            .field("supplier_product_id")
            .and_then(JsonValue::as_str)
            .and_then(|raw| raw.parse::<SupplierProductId>().ok());
        match from_event {
            Some(supplier_product_id) => Ok(Some((supplier_product_id, line_item_quantity(ctx)))),
            None => self.lookup_line(ctx.entity_id),
        }
    }

    fn lookup_line(&self, id: EntityId) -> Result<Option<(SupplierProductId, Option<i64>)>, ActionError> {
        Ok(self
            .services
            .references
            .po_line_item(id)?
            .map(|line| (line.supplier_product_id, Some(line.quantity))))
    }
}

impl ActionHandler for ReceiveInventoryHandler {
    fn action_type(&self) -> &'static str {
        action_types::RECEIVE_INVENTORY
    }

    fn description(&self) -> &'static str {
        "Receive stock into a location"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::ReceiveInventory(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };

        let (product_id, quantity) = match self.resolve(c, ctx)? {
            Source::Resolved { product_id, quantity } => (product_id, quantity),
            Source::Unresolved(reason) => {
                warn!(entity_id = %ctx.entity_id, reason = %reason, "receive_inventory could not resolve its source");
                return Ok(ActionOutcome::new(FAILURE, json!({ "reason": reason })));
            }
        };

        let key = ctx.idempotency_key(self.action_type());
        let query = ItemQuery::at_location(product_id, c.location_id);
        let outcome = run_idempotent(&*self.services.ledger, &*self.services.results, &key, |tx| {
            let Some(mut item) = tx.lock_items(&query)?.into_iter().next() else {
                return Ok(ActionOutcome::new(
                    ITEM_NOT_FOUND,
                    json!({ "product_id": product_id, "location_id": c.location_id }),
                ));
            };
            item.receive(quantity)?;
            tx.update_item(&item)?;

            let record = InventoryTransaction::inbound(product_id, c.location_id, ctx.user_id, quantity)
                .with_reference(c.reference_number.clone(), c.notes.clone());
            tx.insert_transaction(&record)?;

            Ok(ActionOutcome::new(
                RECEIVED,
                json!({
                    "product_id": product_id,
                    "location_id": c.location_id,
                    "inventory_item_id": item.id(),
                    "transaction_id": record.id,
                    "quantity_received": quantity,
                    "quantity": item.quantity(),
                    "available": item.available(),
                }),
            ))
        })?;

        info!(key = %key, product_id = %product_id, port = %outcome.port, quantity, "receive_inventory finished");
        Ok(outcome)
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        vec![
            EntityModification::new("inventory_items", TriggerType::OnUpdate, &["quantity"]),
            EntityModification::new("inventory_transactions", TriggerType::OnCreate, &[]),
        ]
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![
            OutputPort::info(RECEIVED, "Stock was added"),
            OutputPort::info(ITEM_NOT_FOUND, "No inventory item exists for the product at the location"),
            OutputPort::info(FAILURE, "Product or quantity could not be resolved"),
        ]
    }

    fn supports_manual_execution(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{Fixture, config, ctx, ctx_with};
    use crate::references::PoLineItem;
    use serde_json::Map;
    use stockflow_core::LocationId;

    #[test]
    fn explicit_receipt_updates_stock_and_writes_transaction() {
        let fx = Fixture::new();
        let location = LocationId::new();
        let row = fx.row(location, 5, 0, 0);
        let handler = ReceiveInventoryHandler::new(fx.services.clone());
        let cfg = config(
            action_types::RECEIVE_INVENTORY,
            json!({
                "product_id": fx.product.to_string(),
                "quantity": 12,
                "location_id": location.to_string(),
                "reference_number": "PO-7"
            }),
        );
        let ctx = ctx();

        let out = handler.execute(&cfg, &ctx).unwrap();
        let replay = handler.execute(&cfg, &ctx).unwrap();

        assert_eq!(out.port, RECEIVED);
        assert_eq!(out, replay);
        assert_eq!(fx.ledger.item(row.id()).unwrap().quantity(), 17);
        let records = fx.ledger.transactions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].quantity, 12);
        assert_eq!(records[0].reference_number.as_deref(), Some("PO-7"));
        assert_eq!(records[0].user_id, ctx.user_id);
    }

    #[test]
    fn missing_row_exits_item_not_found() {
        let fx = Fixture::new();
        let out = ReceiveInventoryHandler::new(fx.services.clone())
            .execute(
                &config(
                    action_types::RECEIVE_INVENTORY,
                    json!({
                        "product_id": fx.product.to_string(),
                        "quantity": 1,
                        "location_id": LocationId::new().to_string()
                    }),
                ),
                &ctx(),
            )
            .unwrap();
        assert_eq!(out.port, ITEM_NOT_FOUND);
        assert!(fx.ledger.transactions().is_empty());
    }

    #[test]
    fn po_line_item_resolves_through_supplier_product() {
        let fx = Fixture::new();
        let location = LocationId::new();
        let row = fx.row(location, 0, 0, 0);
        let supplier_product = SupplierProductId::new();
        let line = PoLineItem {
            id: EntityId::new(),
            supplier_product_id: supplier_product,
            quantity: 9,
        };
        fx.references.add_supplier_product(supplier_product, fx.product);
        fx.references.add_po_line_item(line);
        let handler = ReceiveInventoryHandler::new(fx.services.clone());

        let configured = config(
            action_types::RECEIVE_INVENTORY,
            json!({
                "location_id": location.to_string(),
                "source_from_po": true,
                "po_line_item_id": line.id.to_string()
            }),
        );
        assert_eq!(handler.execute(&configured, &ctx()).unwrap().port, RECEIVED);
        assert_eq!(fx.ledger.item(row.id()).unwrap().quantity(), 9);

        let mut raw = Map::new();
        raw.insert("supplier_product_id".into(), json!(supplier_product.to_string()));
        raw.insert("quantity".into(), json!(4));
        let from_event = config(
            action_types::RECEIVE_INVENTORY,
            json!({ "location_id": location.to_string(), "source_from_po": true }),
        );
        assert_eq!(handler.execute(&from_event, &ctx_with(raw)).unwrap().port, RECEIVED);
        assert_eq!(fx.ledger.item(row.id()).unwrap().quantity(), 13);
    }

    #[test]
    fn unknown_supplier_product_exits_failure() {
        let fx = Fixture::new();
        let mut raw = Map::new();
        raw.insert("supplier_product_id".into(), json!(SupplierProductId::new().to_string()));
        raw.insert("quantity".into(), json!(4));

        let out = ReceiveInventoryHandler::new(fx.services.clone())
            .execute(
                &config(
                    action_types::RECEIVE_INVENTORY,
                    json!({ "location_id": LocationId::new().to_string(), "source_from_po": true }),
                ),
                &ctx_with(raw),
            )
            .unwrap();
        assert_eq!(out.port, FAILURE);
        assert!(fx.ledger.results().is_empty());
    }
}
