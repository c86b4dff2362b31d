//! Inventory ledger domain (pure).
//!
//! Business rules for stock rows, reservation planning and the records written
//! alongside stock movements. Deterministic domain logic only: no IO, no
//! locking, no storage. The infra layer applies these rules inside its
//! transactions.

pub mod allocation;
pub mod item;
pub mod reservation;
pub mod transaction;

pub use allocation::{
    AllocationStatus, AllocationStrategy, FailedItem, PlannedReservation, ReservationPlan,
    plan_reservation,
};
pub use item::{InventoryItem, StockCounts, StockLevels};
pub use reservation::{Reservation, ReservationStatus, consume_reservations};
pub use transaction::{InventoryTransaction, TransactionType};
