use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{LocationId, ProductId, TransactionId, UserId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Goods received into a location.
    Inbound,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Inbound => "inbound",
        }
    }
}

/// Immutable movement record written in the same transaction as the stock change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub id: TransactionId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub user_id: UserId,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InventoryTransaction {
    pub fn inbound(
        product_id: ProductId,
        location_id: LocationId,
        user_id: UserId,
        quantity: i64,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            product_id,
            location_id,
            user_id,
            transaction_type: TransactionType::Inbound,
            quantity,
            reference_number: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_reference(mut self, reference_number: Option<String>, notes: Option<String>) -> Self {
        self.reference_number = reference_number;
        self.notes = notes;
        self
    }
}
