//! Inventory ledger: the shared stock rows and everything written alongside them.
//!
//! ## Transactions
//!
//! Every mutation goes through a [`LedgerTransaction`]:
//!
//! 1. `begin()`
//! 2. `lock_items` / `lock_item` (row locks, held until commit or rollback)
//! 3. compute new values on the domain types
//! 4. `update_item`, `insert_reservation`, `insert_transaction`, `record_result`
//! 5. `commit()`
//!
//! Nothing is visible to other transactions before commit. A transaction
//! dropped without commit rolls back.
//!
//! ## Idempotency
//!
//! `record_result` stages an [`AllocationResult`] under its key. If another
//! transaction committed the same key first, `record_result` or `commit` fails with
//! [`LedgerError::DuplicateKey`] and none of this transaction's writes apply;
//! the caller then replays the stored result.

pub mod in_memory;
pub mod postgres;
pub mod results;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockflow_automation::{ActionError, IdempotencyKey};
use stockflow_core::{DomainError, InventoryItemId, LocationId, ProductId, WarehouseId};
use stockflow_inventory::{InventoryItem, InventoryTransaction, Reservation};

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use results::{AllocationResult, AllocationResultStore, InMemoryAllocationResults, PostgresAllocationResults};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("idempotency key already recorded: {0}")]
    DuplicateKey(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("row {0} is not locked by this transaction")]
    NotLocked(InventoryItemId),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for ActionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Domain(domain) => ActionError::from(domain),
            other => ActionError::Storage(other.to_string()),
        }
    }
}

/// Which stock rows an operation targets.
///
/// `location_id` and `warehouse_id` narrow the product's rows; a warehouse
/// matches every location assigned to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemQuery {
    pub product_id: ProductId,
    pub location_id: Option<LocationId>,
    pub warehouse_id: Option<WarehouseId>,
}

impl ItemQuery {
    pub fn product(product_id: ProductId) -> Self {
        Self {
            product_id,
            location_id: None,
            warehouse_id: None,
        }
    }

    pub fn at_location(product_id: ProductId, location_id: LocationId) -> Self {
        Self {
            location_id: Some(location_id),
            ..Self::product(product_id)
        }
    }

    pub fn scoped(product_id: ProductId, location_id: Option<LocationId>, warehouse_id: Option<WarehouseId>) -> Self {
        Self {
            product_id,
            location_id,
            warehouse_id,
        }
    }
}

pub trait InventoryLedger: Send + Sync {
    /// Unlocked read of the rows matching `query`.
    fn find_items(&self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError>;

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, LedgerError>;

    /// Active reservations whose `expires_at` is at or before `now`, oldest
    /// first.
    fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, LedgerError>;
}

pub trait LedgerTransaction {
    /// Lock and return every row matching `query`.
    fn lock_items(&mut self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError>;

    fn lock_item(&mut self, id: InventoryItemId) -> Result<Option<InventoryItem>, LedgerError>;

    /// Write back a row this transaction holds the lock for.
    fn update_item(&mut self, item: &InventoryItem) -> Result<(), LedgerError>;

    /// Reservation records of a locked row, any status.
    fn reservations_for_item(&mut self, item_id: InventoryItemId) -> Result<Vec<Reservation>, LedgerError>;

    fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), LedgerError>;

    fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), LedgerError>;

    fn insert_transaction(&mut self, transaction: &InventoryTransaction) -> Result<(), LedgerError>;

    /// Stage the write-once result for `key`. A conflicting key surfaces as
    /// `DuplicateKey` here or at commit, depending on the backend.
    fn record_result(&mut self, key: &IdempotencyKey, result: &serde_json::Value) -> Result<(), LedgerError>;

    fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

impl<L> InventoryLedger for std::sync::Arc<L>
where
    L: InventoryLedger + ?Sized,
{
    fn find_items(&self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        (**self).find_items(query)
    }

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, LedgerError> {
        (**self).begin()
    }

    fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, LedgerError> {
        (**self).expired_reservations(now, limit)
    }
}
