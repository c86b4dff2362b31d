//! `commit_allocation` and `release_reservation`: moves out of `reserved` on
//! one (product, location) row.

use serde_json::json;
use tracing::info;

use stockflow_automation::config::action_types;
use stockflow_automation::{
    ActionConfig, ActionError, ActionHandler, ActionOutcome, EntityModification, ExecutionContext, IdempotencyKey,
    OutputPort, StockMoveConfig,
};
use stockflow_events::TriggerType;
use stockflow_inventory::{ReservationStatus, consume_reservations};

use super::check_inventory::wrong_config;
use super::{InventoryServices, run_idempotent};
use crate::ledger::ItemQuery;

pub const COMMITTED: &str = "committed";
pub const RELEASED: &str = "released";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Move {
    Commit,
    Release,
}

impl Move {
    fn port(self) -> &'static str {
        match self {
            Move::Commit => COMMITTED,
            Move::Release => RELEASED,
        }
    }

    fn settles_as(self) -> ReservationStatus {
        match self {
            Move::Commit => ReservationStatus::Committed,
            Move::Release => ReservationStatus::Released,
        }
    }
}

fn move_reserved(
    services: &InventoryServices,
    key: &IdempotencyKey,
    c: &StockMoveConfig,
    kind: Move,
) -> Result<ActionOutcome, ActionError> {
    let query = ItemQuery::at_location(c.product_id, c.location_id);
    let outcome = run_idempotent(&*services.ledger, &*services.results, key, |tx| {
        let mut item = tx.lock_items(&query)?.into_iter().next().ok_or_else(|| {
            ActionError::UnresolvedReference(format!(
                "no inventory item for product {} at location {}",
                c.product_id, c.location_id
            ))
        })?;
        match kind {
            Move::Commit => item.commit(c.quantity)?,
            Move::Release => item.release(c.quantity)?,
        }
        tx.update_item(&item)?;

        let before = tx.reservations_for_item(item.id())?;
        let mut after = before.clone();
        let matched = consume_reservations(&mut after, c.quantity, kind.settles_as());
        for reservation in after.iter().filter(|r| !before.contains(r)) {
            tx.update_reservation(reservation)?;
        }

        Ok(ActionOutcome::new(
            kind.port(),
            json!({
                "product_id": c.product_id,
                "location_id": c.location_id,
                "inventory_item_id": item.id(),
                "quantity": c.quantity,
                "reservations_matched": matched,
                "reserved_quantity": item.reserved_quantity(),
                "allocated_quantity": item.allocated_quantity(),
                "available": item.available(),
            }),
        ))
    })?;

    info!(key = %key, product_id = %c.product_id, port = %outcome.port, quantity = c.quantity, "stock move finished");
    Ok(outcome)
}

/// Move reserved stock to allocated.
pub struct CommitAllocationHandler {
    services: InventoryServices,
}

impl CommitAllocationHandler {
    pub fn new(services: InventoryServices) -> Self {
        Self { services }
    }
}

impl ActionHandler for CommitAllocationHandler {
    fn action_type(&self) -> &'static str {
        action_types::COMMIT_ALLOCATION
    }

    fn description(&self) -> &'static str {
        "Commit reserved stock to allocation"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::CommitAllocation(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };
        move_reserved(&self.services, &ctx.idempotency_key(self.action_type()), c, Move::Commit)
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        vec![
            EntityModification::new(
                "inventory_items",
                TriggerType::OnUpdate,
                &["reserved_quantity", "allocated_quantity"],
            ),
            EntityModification::new("inventory_reservations", TriggerType::OnUpdate, &["remaining", "status"]),
        ]
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![OutputPort::info(COMMITTED, "Reserved stock moved to allocated")]
    }

    fn supports_manual_execution(&self) -> bool {
        true
    }
}

/// Drop reserved stock back to available.
pub struct ReleaseReservationHandler {
    services: InventoryServices,
}

impl ReleaseReservationHandler {
    pub fn new(services: InventoryServices) -> Self {
        Self { services }
    }
}

impl ActionHandler for ReleaseReservationHandler {
    fn action_type(&self) -> &'static str {
        action_types::RELEASE_RESERVATION
    }

    fn description(&self) -> &'static str {
        "Release reserved stock"
    }

    fn execute(&self, config: &ActionConfig, ctx: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let ActionConfig::ReleaseReservation(c) = config else {
            return Err(wrong_config(self.action_type(), config));
        };
        move_reserved(&self.services, &ctx.idempotency_key(self.action_type()), c, Move::Release)
    }

    fn entity_modifications(&self, _config: &ActionConfig) -> Vec<EntityModification> {
        vec![
            EntityModification::new("inventory_items", TriggerType::OnUpdate, &["reserved_quantity"]),
            EntityModification::new("inventory_reservations", TriggerType::OnUpdate, &["remaining", "status"]),
        ]
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        vec![OutputPort::info(RELEASED, "Reserved stock returned to available")]
    }

    fn supports_manual_execution(&self) -> bool {
        true
    }
}
