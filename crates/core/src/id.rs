//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a user (actor identity).
    UserId,
    "UserId"
);
uuid_newtype!(
    /// Identifier of a mutated business record referenced by a trigger event.
    EntityId,
    "EntityId"
);
uuid_newtype!(
    /// Identifier of an automation rule.
    RuleId,
    "RuleId"
);
uuid_newtype!(
    /// Identifier of a node (rule action) in a rule's action graph.
    ActionId,
    "ActionId"
);
uuid_newtype!(
    /// Identifier of a reusable action template.
    TemplateId,
    "TemplateId"
);
uuid_newtype!(
    /// Identifier of one durable execution of a rule.
    ///
    /// Stable across retries of the same run.
    ExecutionId,
    "ExecutionId"
);
uuid_newtype!(
    /// Identifier of a durable workflow run record.
    RunId,
    "RunId"
);
uuid_newtype!(ProductId, "ProductId");

impl ExecutionId {
    /// Deterministic child id for one step of this execution.
    ///
    /// The same (execution, step) pair always yields the same id, so retries
    /// of a step see the identity of the original attempt.
    pub fn for_step(&self, step: &Uuid) -> Self {
        Self(Uuid::new_v5(&self.0, step.as_bytes()))
    }
}

uuid_newtype!(LocationId, "LocationId");
uuid_newtype!(WarehouseId, "WarehouseId");
uuid_newtype!(InventoryItemId, "InventoryItemId");
uuid_newtype!(ReservationId, "ReservationId");
uuid_newtype!(TransactionId, "TransactionId");
uuid_newtype!(SupplierProductId, "SupplierProductId");
