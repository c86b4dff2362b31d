use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use stockflow_automation::config::action_types;
use stockflow_automation::{
    ActionConfig, ActionError, ActionHandler, ActionOutcome, EntityModification, ExecutionContext, OutputPort,
};
use stockflow_core::ReservationId;
use stockflow_events::TriggerType;
use stockflow_inventory::{AllocationStatus, FailedItem, Reservation, ReservationStatus, plan_reservation};

use super::check_inventory::wrong_config;
use super::{InventoryServices, line_item_quantity, resolve_product, run_idempotent};
use crate::ledger::ItemQuery;

pub const RESERVED: &str = "reserved";
pub const PARTIAL: &str = "partial";
pub const FAILED: &str = "failed";

/// Soft-hold stock across candidate rows in allocation-strategy order.
pub struct ReserveInventoryHandler {
    services: InventoryServices,
}

impl ReserveInventoryHandler {
    pub fn new(services: InventoryServices) -> Self {
        Self { services }
    }
}

impl ActionHandler for ReserveInventoryHandler {
    fn action_type(&self) -> &'static str {
        action_types::RESERVE_INVENTORY
    }

    fn description(&self) -> &'static str {
        "Reserve available stock for a product"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::ReserveInventory(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };
        if !c.allocation_strategy.is_supported() {
            return Err(ActionError::Unsupported(format!(
                "allocation strategy '{}' is not available",
                c.allocation_strategy
            )));
        }

        let product_id = resolve_product(c.product_id, c.source_from_line_item, ctx)?;
        let requested = if c.quantity > 0 {
            c.quantity
        } else {
            line_item_quantity(ctx)
                .filter(|q| *q > 0)
                .ok_or_else(|| ActionError::UnresolvedReference(format!("{} has no positive quantity", ctx.entity_name)))?
        };
        let hours = c
            .reservation_duration_hours
            .unwrap_or(self.services.default_reservation_hours);
        let hold = Duration::try_hours(hours)
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| ActionError::Unsupported(format!("reservation duration of {hours}h is out of range")))?;
        let key = ctx.idempotency_key(self.action_type());
        let query = ItemQuery::scoped(product_id, c.location_id, c.warehouse_id);

        let outcome = run_idempotent(&*self.services.ledger, &*self.services.results, &key, |tx| {
            let mut candidates = tx.lock_items(&query)?;
            c.allocation_strategy.order_candidates(&mut candidates)?;
            let available = candidates
                .iter()
                .fold(0i64, |sum, i| sum.saturating_add(i.available().max(0)));
            let plan = plan_reservation(&candidates, requested, c.allow_partial)?;

            let now = Utc::now();
            let expires_at = now
                .checked_add_signed(hold)
                .ok_or_else(|| ActionError::Unsupported(format!("reservation expiry {hours}h from now is out of range")))?;
            let mut reservations = Vec::with_capacity(plan.lines.len());
            for line in &plan.lines {
                let item = candidates
                    .iter_mut()
                    .find(|i| i.id() == line.item_id)
                    .ok_or_else(|| ActionError::Invariant(format!("planned row {} was not locked", line.item_id)))?;
                item.reserve(line.quantity)?;
                tx.update_item(item)?;

                let reservation = Reservation {
                    id: ReservationId::new(),
                    idempotency_key: key.to_string(),
                    item_id: item.id(),
                    product_id,
                    location_id: item.location_id(),
                    quantity: line.quantity,
                    remaining: line.quantity,
                    reference_id: c.reference_id.clone(),
                    reference_type: c.reference_type.clone(),
                    status: ReservationStatus::Active,
                    expires_at,
                    created_at: now,
                };
                tx.insert_reservation(&reservation)?;
                reservations.push(json!({
                    "reservation_id": reservation.id,
                    "inventory_item_id": reservation.item_id,
                    "location_id": reservation.location_id,
                    "quantity": reservation.quantity,
                }));
            }

            let status = plan.status();
            let failed_items: Vec<FailedItem> = if plan.shortfall() > 0 {
                vec![FailedItem {
                    product_id,
                    requested_quantity: requested,
                    available_quantity: available,
                    shortfall: plan.shortfall(),
                    reason: "insufficient available stock".into(),
                }]
            } else {
                Vec::new()
            };
            let port = match status {
                AllocationStatus::Success => RESERVED,
                AllocationStatus::Partial => PARTIAL,
                AllocationStatus::Failed => FAILED,
            };

            Ok(ActionOutcome::new(
                port,
                json!({
                    "status": status,
                    "product_id": product_id,
                    "allocation_strategy": c.allocation_strategy,
                    "total_requested": plan.total_requested,
                    "total_reserved": plan.total_reserved,
                    "reservations": reservations,
                    "failed_items": failed_items,
                    "expires_at": expires_at,
                    "reference_id": c.reference_id,
                    "reference_type": c.reference_type,
                }),
            ))
        })?;

        info!(
            key = %key,
            product_id = %product_id,
            port = %outcome.port,
            total_reserved = %outcome.data["total_reserved"],
            "reserve_inventory finished"
        );
        Ok(outcome)
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        vec![
            EntityModification::new("inventory_items", TriggerType::OnUpdate, &["reserved_quantity"]),
            EntityModification::new("inventory_reservations", TriggerType::OnCreate, &[]),
            EntityModification::new("allocation_results", TriggerType::OnCreate, &[]),
        ]
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![
            OutputPort::info(RESERVED, "The full quantity was reserved"),
            OutputPort::info(PARTIAL, "Part of the quantity was reserved"),
            OutputPort::info(FAILED, "Nothing could be reserved"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::fixtures::{Fixture, config, ctx, ctx_with};
    use serde_json::Map;
    use std::thread;
    use std::time::Duration as StdDuration;
    use stockflow_automation::ConfigError;
    use stockflow_core::LocationId;

    fn reserve(fx: &Fixture, quantity: i64, extra: serde_json::Value) -> ActionConfig {
        let mut value = json!({ "product_id": fx.product.to_string(), "quantity": quantity });
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        config(action_types::RESERVE_INVENTORY, value)
    }

    #[test]
    fn retry_with_same_context_reserves_once() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 50, 0, 0);
        let handler = ReserveInventoryHandler::new(fx.services.clone());
        let cfg = reserve(&fx, 20, json!({}));
        let ctx = ctx();

        let first = handler.execute(&cfg, &ctx).unwrap();
        let second = handler.execute(&cfg, &ctx).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.port, RESERVED);
        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 20);
        assert_eq!(fx.ledger.reservations().len(), 1);
        assert_eq!(fx.ledger.results().len(), 1);
    }

    #[test]
    fn fifo_drains_oldest_row_and_lifo_newest() {
        for (strategy, drained, touched) in [("fifo", 0, 1), ("lifo", 2, 1)] {
            let fx = Fixture::new();
            let rows: Vec<_> = (0..3)
                .map(|_| {
                    // Distinct creation times.
                    thread::sleep(StdDuration::from_millis(2));
                    fx.row(LocationId::new(), 30, 0, 0)
                })
                .collect();

            ReserveInventoryHandler::new(fx.services.clone())
                .execute(&reserve(&fx, 45, json!({ "allocation_strategy": strategy })), &ctx())
                .unwrap();

            let reserved = |i: usize| fx.ledger.item(rows[i].id()).unwrap().reserved_quantity();
            assert_eq!(reserved(drained), 30, "{strategy}");
            assert_eq!(reserved(touched), 15, "{strategy}");
            assert_eq!(reserved(2 - drained), 0, "{strategy}");
        }
    }

    #[test]
    fn partial_fulfilment_reports_the_shortfall() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 60, 0, 0);
        let handler = ReserveInventoryHandler::new(fx.services.clone());

        let out = handler
            .execute(&reserve(&fx, 100, json!({ "allow_partial": true })), &ctx())
            .unwrap();

        assert_eq!(out.port, PARTIAL);
        assert_eq!(out.data["status"], "partial");
        assert_eq!(out.data["total_reserved"], 60);
        let failed = out.data["failed_items"].as_array().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["shortfall"], 40);
        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 60);
    }

    #[test]
    fn shortfall_without_partial_rolls_back() {
        let fx = Fixture::new();
        let a = fx.row(LocationId::new(), 30, 0, 0);
        let b = fx.row(LocationId::new(), 30, 0, 0);

        let err = ReserveInventoryHandler::new(fx.services.clone())
            .execute(&reserve(&fx, 100, json!({})), &ctx())
            .unwrap_err();

        assert_eq!(err, ActionError::InsufficientStock { requested: 100, available: 60 });
        assert!(!err.is_permanent());
        assert_eq!(fx.ledger.item(a.id()).unwrap().reserved_quantity(), 0);
        assert_eq!(fx.ledger.item(b.id()).unwrap().reserved_quantity(), 0);
        assert!(fx.ledger.reservations().is_empty());
        assert!(fx.ledger.results().is_empty());
    }

    #[test]
    fn nothing_available_with_partial_exits_failed() {
        let fx = Fixture::new();
        fx.row(LocationId::new(), 5, 5, 0);

        let out = ReserveInventoryHandler::new(fx.services.clone())
            .execute(&reserve(&fx, 3, json!({ "allow_partial": true })), &ctx())
            .unwrap();

        assert_eq!(out.port, FAILED);
        assert_eq!(out.data["total_reserved"], 0);
    }

    #[test]
    fn records_reservations_with_expiry_and_reference() {
        let fx = Fixture::new();
        fx.row(LocationId::new(), 10, 0, 0);
        let before = Utc::now();

        ReserveInventoryHandler::new(fx.services.clone())
            .execute(
                &reserve(
                    &fx,
                    4,
                    json!({ "reservation_duration_hours": 2, "reference_id": "SO-1", "reference_type": "sales_order" }),
                ),
                &ctx(),
            )
            .unwrap();

        let records = fx.ledger.reservations();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!((r.quantity, r.remaining, r.status), (4, 4, ReservationStatus::Active));
        assert_eq!(r.reference_id.as_deref(), Some("SO-1"));
        assert!(r.expires_at >= before + Duration::hours(2));
        assert!(r.expires_at <= Utc::now() + Duration::hours(2));
    }

    #[test]
    fn out_of_range_hold_is_rejected_without_reserving() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 10, 0, 0);
        let handler = ReserveInventoryHandler::new(fx.services.clone());
        let cfg = ActionConfig::parse(
            action_types::RESERVE_INVENTORY,
            &json!({ "product_id": fx.product.to_string(), "quantity": 1, "reservation_duration_hours": i64::MAX }),
        )
        .unwrap();

        assert!(matches!(handler.validate(&cfg), Err(ConfigError::Invalid { .. })));
        let err = handler.execute(&cfg, &ctx()).unwrap_err();
        assert!(matches!(err, ActionError::Unsupported(_)));
        assert!(err.is_permanent());
        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 0);
        assert!(fx.ledger.reservations().is_empty());
        assert!(fx.ledger.results().is_empty());
    }

    #[test]
    fn out_of_range_default_hold_is_rejected() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 10, 0, 0);
        let handler = ReserveInventoryHandler::new(fx.services.clone().with_default_reservation_hours(i64::MAX));

        let err = handler.execute(&reserve(&fx, 1, json!({})), &ctx()).unwrap_err();

        assert!(matches!(err, ActionError::Unsupported(_)));
        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 0);
    }

    #[test]
    fn quantity_from_line_item() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 10, 0, 0);
        let mut raw = Map::new();
        raw.insert("product_id".into(), json!(fx.product.to_string()));
        raw.insert("quantity".into(), json!(7));

        ReserveInventoryHandler::new(fx.services.clone())
            .execute(
                &config(action_types::RESERVE_INVENTORY, json!({ "source_from_line_item": true })),
                &ctx_with(raw),
            )
            .unwrap();

        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 7);
    }

    #[test]
    fn reserved_strategies_are_rejected_not_approximated() {
        let fx = Fixture::new();
        let row = fx.row(LocationId::new(), 10, 0, 0);
        let cfg = ActionConfig::parse(
            action_types::RESERVE_INVENTORY,
            &json!({ "product_id": fx.product.to_string(), "quantity": 1, "allocation_strategy": "lowest_cost" }),
        )
        .unwrap();
        let handler = ReserveInventoryHandler::new(fx.services.clone());

        assert!(matches!(handler.validate(&cfg), Err(ConfigError::Invalid { .. })));
        let err = handler.execute(&cfg, &ctx()).unwrap_err();
        assert!(matches!(err, ActionError::Unsupported(_)));
        assert!(err.is_permanent());
        assert_eq!(fx.ledger.item(row.id()).unwrap().reserved_quantity(), 0);
    }
}
