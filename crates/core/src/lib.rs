//! `stockflow-core`: shared domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the domain error model.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{
    ActionId, EntityId, ExecutionId, InventoryItemId, LocationId, ProductId, ReservationId,
    RuleId, RunId, SupplierProductId, TemplateId, TransactionId, UserId, WarehouseId,
};
