use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{DomainError, DomainResult, InventoryItemId, LocationId, ProductId};

/// Quantity columns of a stock row.
///
/// Invariant: `0 <= reserved`, `0 <= allocated`, `reserved + allocated <= quantity`.
/// `available` is always derived, never stored.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCounts {
    pub quantity: i64,
    pub reserved: i64,
    pub allocated: i64,
}

impl StockCounts {
    pub fn new(quantity: i64, reserved: i64, allocated: i64) -> DomainResult<Self> {
        let counts = Self {
            quantity,
            reserved,
            allocated,
        };
        counts.check()?;
        Ok(counts)
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.reserved - self.allocated
    }

    pub fn check(&self) -> DomainResult<()> {
        if self.reserved < 0 || self.allocated < 0 {
            return Err(DomainError::invariant(format!(
                "negative reservation state (reserved={}, allocated={})",
                self.reserved, self.allocated
            )));
        }
        // Checked: overflow here would itself be a corrupt state.
        let committed = self
            .reserved
            .checked_add(self.allocated)
            .ok_or_else(|| DomainError::invariant("reserved + allocated overflows"))?;
        if committed > self.quantity {
            return Err(DomainError::invariant(format!(
                "reserved + allocated ({committed}) exceeds quantity ({})",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Planning thresholds carried on a stock row.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub minimum_stock: i64,
    pub maximum_stock: i64,
    pub reorder_point: i64,
    pub safety_stock: i64,
    pub avg_daily_usage: i64,
}

/// One stock row: a product held at a location.
///
/// Quantity-moving operations validate first and only then mutate, so a
/// rejected operation leaves the row untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    id: InventoryItemId,
    product_id: ProductId,
    location_id: LocationId,
    counts: StockCounts,
    pub levels: StockLevels,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InventoryItem {
    /// A fresh row holding `quantity` units, nothing reserved or allocated.
    pub fn new(product_id: ProductId, location_id: LocationId, quantity: i64) -> DomainResult<Self> {
        let now = Utc::now();
        Self::restore(
            InventoryItemId::new(),
            product_id,
            location_id,
            StockCounts::new(quantity, 0, 0)?,
            StockLevels::default(),
            now,
            now,
        )
    }

    /// Rehydrate a row read from storage, rejecting corrupt counts.
    pub fn restore(
        id: InventoryItemId,
        product_id: ProductId,
        location_id: LocationId,
        counts: StockCounts,
        levels: StockLevels,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        counts.check()?;
        Ok(Self {
            id,
            product_id,
            location_id,
            counts,
            levels,
            created_at,
            updated_at,
        })
    }

    pub fn with_levels(mut self, levels: StockLevels) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> InventoryItemId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn counts(&self) -> StockCounts {
        self.counts
    }

    pub fn quantity(&self) -> i64 {
        self.counts.quantity
    }

    pub fn reserved_quantity(&self) -> i64 {
        self.counts.reserved
    }

    pub fn allocated_quantity(&self) -> i64 {
        self.counts.allocated
    }

    pub fn available(&self) -> i64 {
        self.counts.available()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Soft-hold `qty` units of available stock.
    pub fn reserve(&mut self, qty: i64) -> DomainResult<()> {
        ensure_positive(qty)?;
        if qty > self.available() {
            return Err(DomainError::insufficient(qty, self.available()));
        }
        self.apply(StockCounts {
            reserved: self.counts.reserved + qty,
            ..self.counts
        })
    }

    /// Drop a soft hold.
    pub fn release(&mut self, qty: i64) -> DomainResult<()> {
        ensure_positive(qty)?;
        if qty > self.counts.reserved {
            return Err(DomainError::insufficient(qty, self.counts.reserved));
        }
        self.apply(StockCounts {
            reserved: self.counts.reserved - qty,
            ..self.counts
        })
    }

    /// Move `qty` units from reserved to allocated.
    pub fn commit(&mut self, qty: i64) -> DomainResult<()> {
        ensure_positive(qty)?;
        if qty > self.counts.reserved {
            return Err(DomainError::insufficient(qty, self.counts.reserved));
        }
        self.apply(StockCounts {
            reserved: self.counts.reserved - qty,
            allocated: self.counts.allocated + qty,
            ..self.counts
        })
    }

    /// Add `qty` units of on-hand stock.
    pub fn receive(&mut self, qty: i64) -> DomainResult<()> {
        ensure_positive(qty)?;
        let quantity = self
            .counts
            .quantity
            .checked_add(qty)
            .ok_or_else(|| DomainError::validation("received quantity overflows on-hand stock"))?;
        self.apply(StockCounts {
            quantity,
            ..self.counts
        })
    }

    fn apply(&mut self, next: StockCounts) -> DomainResult<()> {
        next.check()?;
        self.counts = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn ensure_positive(qty: i64) -> DomainResult<()> {
    if qty <= 0 {
        return Err(DomainError::validation(format!(
            "quantity must be positive, got {qty}"
        )));
    }
    Ok(())
}
