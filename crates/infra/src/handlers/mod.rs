//! Inventory action handlers.
//!
//! Read-only handlers (`check_inventory`, `check_reorder_point`) sum unlocked
//! rows. Mutating handlers share one shape, implemented by [`run_idempotent`]:
//!
//! 1. look up the step's idempotency key; a hit replays the stored outcome
//! 2. `begin()` and lock the target rows
//! 3. apply the change on the domain types and write it back
//! 4. record the outcome under the key in the same transaction
//! 5. commit; losing a race on the key rolls back and replays the winner

pub mod check_inventory;
pub mod check_reorder_point;
pub mod receive_inventory;
pub mod reserve_inventory;
pub mod stock_moves;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use stockflow_automation::{ActionError, ActionOutcome, ExecutionContext, HandlerRegistry, IdempotencyKey};
use stockflow_core::ProductId;

use crate::ledger::{AllocationResult, AllocationResultStore, InventoryLedger, LedgerError, LedgerTransaction};
use crate::references::ReferenceLookup;

pub use check_inventory::CheckInventoryHandler;
pub use check_reorder_point::CheckReorderPointHandler;
pub use receive_inventory::ReceiveInventoryHandler;
pub use reserve_inventory::ReserveInventoryHandler;
pub use stock_moves::{CommitAllocationHandler, ReleaseReservationHandler};

pub const DEFAULT_RESERVATION_HOURS: i64 = 24;

/// Storage the inventory handlers run against.
#[derive(Clone)]
pub struct InventoryServices {
    pub ledger: Arc<dyn InventoryLedger>,
    pub results: Arc<dyn AllocationResultStore>,
    pub references: Arc<dyn ReferenceLookup>,
    /// `expires_at` horizon for reservations whose config omits one.
    pub default_reservation_hours: i64,
}

impl InventoryServices {
    pub fn new(
        ledger: Arc<dyn InventoryLedger>,
        results: Arc<dyn AllocationResultStore>,
        references: Arc<dyn ReferenceLookup>,
    ) -> Self {
        Self {
            ledger,
            results,
            references,
            default_reservation_hours: DEFAULT_RESERVATION_HOURS,
        }
    }

    pub fn with_default_reservation_hours(mut self, hours: i64) -> Self {
        self.default_reservation_hours = hours;
        self
    }
}

impl core::fmt::Debug for InventoryServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InventoryServices")
            .field("default_reservation_hours", &self.default_reservation_hours)
            .finish_non_exhaustive()
    }
}

/// Register all six inventory handlers.
pub fn register_inventory_handlers(registry: &mut HandlerRegistry, services: &InventoryServices) {
    registry.register(Arc::new(CheckInventoryHandler::new(services.ledger.clone())));
    registry.register(Arc::new(CheckReorderPointHandler::new(services.ledger.clone())));
    registry.register(Arc::new(ReserveInventoryHandler::new(services.clone())));
    registry.register(Arc::new(CommitAllocationHandler::new(services.clone())));
    registry.register(Arc::new(ReleaseReservationHandler::new(services.clone())));
    registry.register(Arc::new(ReceiveInventoryHandler::new(services.clone())));
}

/// Product from config, or from the triggering line item's `product_id`.
pub(crate) fn resolve_product(
    configured: Option<ProductId>,
    source_from_line_item: bool,
    ctx: &ExecutionContext,
) -> Result<ProductId, ActionError> {
    if source_from_line_item {
        let raw = ctx
            .field("product_id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ActionError::UnresolvedReference(format!("{} has no product_id", ctx.entity_name)))?;
        return raw
            .parse()
            .map_err(|_| ActionError::UnresolvedReference(format!("{} product_id '{raw}' is not an id", ctx.entity_name)));
    }
    configured.ok_or_else(|| ActionError::UnresolvedReference("no product_id configured".into()))
}

/// `quantity` of the triggering line item, when it is an integer.
pub(crate) fn line_item_quantity(ctx: &ExecutionContext) -> Option<i64> {
    ctx.field("quantity").and_then(JsonValue::as_i64)
}

/// Run `work` in one ledger transaction at most once per `key`.
pub(crate) fn run_idempotent<F>(
    ledger: &dyn InventoryLedger,
    results: &dyn AllocationResultStore,
    key: &IdempotencyKey,
    work: F,
) -> Result<ActionOutcome, ActionError>
where
    F: FnOnce(&mut dyn LedgerTransaction) -> Result<ActionOutcome, ActionError>,
{
    if let Some(stored) = results.get(key)? {
        debug!(key = %key, "idempotency hit; replaying stored outcome");
        return replay(stored);
    }

    let mut tx = ledger.begin()?;
    let outcome = match work(tx.as_mut()) {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(key = %key, error = %rollback_err, "rollback failed");
            }
            return Err(err);
        }
    };

    let payload = match serde_json::to_value(&outcome) {
        Ok(payload) => payload,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                warn!(key = %key, error = %rollback_err, "rollback failed");
            }
            return Err(ActionError::Storage(format!("outcome is not serializable: {err}")));
        }
    };

    if let Err(err) = tx.record_result(key, &payload) {
        if let Err(rollback_err) = tx.rollback() {
            warn!(key = %key, error = %rollback_err, "rollback failed");
        }
        return settle_conflict(results, key, err);
    }

    match tx.commit() {
        Ok(()) => Ok(outcome),
        Err(err) => settle_conflict(results, key, err),
    }
}

/// A concurrent attempt recorded `key` first: its outcome is the outcome.
fn settle_conflict(
    results: &dyn AllocationResultStore,
    key: &IdempotencyKey,
    err: LedgerError,
) -> Result<ActionOutcome, ActionError> {
    match err {
        LedgerError::DuplicateKey(_) => {
            debug!(key = %key, "lost idempotency race; replaying winner");
            let stored = results
                .get(key)?
                .ok_or_else(|| ActionError::Storage(format!("result for {key} missing after conflict")))?;
            replay(stored)
        }
        other => Err(other.into()),
    }
}

fn replay(stored: AllocationResult) -> Result<ActionOutcome, ActionError> {
    serde_json::from_value(stored.result)
        .map_err(|e| ActionError::Storage(format!("stored result for {} is unreadable: {e}", stored.idempotency_key)))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use serde_json::{Map, Value as JsonValue};
    use stockflow_automation::{ActionConfig, ExecutionContext};
    use stockflow_core::{EntityId, ExecutionId, LocationId, ProductId, RuleId, UserId};
    use stockflow_inventory::{InventoryItem, StockCounts, StockLevels};

    use super::InventoryServices;
    use crate::ledger::InMemoryLedger;
    use crate::references::InMemoryReferences;

    pub struct Fixture {
        pub ledger: Arc<InMemoryLedger>,
        pub references: Arc<InMemoryReferences>,
        pub services: InventoryServices,
        pub product: ProductId,
    }

    impl Fixture {
        pub fn new() -> Self {
            let ledger = InMemoryLedger::arc();
            let references = Arc::new(InMemoryReferences::new());
            let services = InventoryServices::new(ledger.clone(), ledger.results(), references.clone());
            Self {
                ledger,
                references,
                services,
                product: ProductId::new(),
            }
        }

        /// Seed a row for the fixture's product.
        pub fn row(&self, location: LocationId, quantity: i64, reserved: i64, allocated: i64) -> InventoryItem {
            self.row_with_levels(location, quantity, reserved, allocated, StockLevels::default())
        }

        pub fn row_with_levels(
            &self,
            location: LocationId,
            quantity: i64,
            reserved: i64,
            allocated: i64,
            levels: StockLevels,
        ) -> InventoryItem {
            let base = InventoryItem::new(self.product, location, quantity).unwrap();
            let item = InventoryItem::restore(
                base.id(),
                self.product,
                location,
                StockCounts::new(quantity, reserved, allocated).unwrap(),
                levels,
                base.created_at(),
                base.updated_at(),
            )
            .unwrap();
            self.ledger.insert_item(item.clone()).unwrap();
            item
        }
    }

    pub fn ctx() -> ExecutionContext {
        ctx_with(Map::new())
    }

    pub fn ctx_with(raw_data: Map<String, JsonValue>) -> ExecutionContext {
        let mut ctx = ExecutionContext::manual("sales_order_line_items", EntityId::new(), raw_data, UserId::new());
        ctx.execution_id = ExecutionId::new();
        ctx.rule_id = Some(RuleId::new());
        ctx
    }

    pub fn config(action_type: &str, value: JsonValue) -> ActionConfig {
        let config = ActionConfig::parse(action_type, &value).unwrap();
        config.validate().unwrap();
        config
    }
}
