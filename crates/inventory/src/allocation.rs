//! Reservation planning across candidate stock rows.

use serde::{Deserialize, Serialize};

use stockflow_core::{DomainError, DomainResult, InventoryItemId, ProductId};

use crate::item::InventoryItem;

/// Order in which candidate rows are drawn down.
///
/// Only `fifo` and `lifo` have a query path over the current data model. The
/// remaining names are accepted by parsing so stored rule configs stay
/// readable, but they are rejected by validation and by [`order_candidates`]
/// rather than approximated.
///
/// [`order_candidates`]: AllocationStrategy::order_candidates
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    Fifo,
    Lifo,
    NearestExpiry,
    LowestCost,
    NearestLocation,
    LoadBalancing,
    PriorityZone,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::Fifo => "fifo",
            AllocationStrategy::Lifo => "lifo",
            AllocationStrategy::NearestExpiry => "nearest_expiry",
            AllocationStrategy::LowestCost => "lowest_cost",
            AllocationStrategy::NearestLocation => "nearest_location",
            AllocationStrategy::LoadBalancing => "load_balancing",
            AllocationStrategy::PriorityZone => "priority_zone",
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, AllocationStrategy::Fifo | AllocationStrategy::Lifo)
    }

    /// Sort candidates into draw-down order.
    ///
    /// Ties on creation time fall back to row id so ordering is total.
    pub fn order_candidates(&self, candidates: &mut [InventoryItem]) -> DomainResult<()> {
        match self {
            AllocationStrategy::Fifo => {
                candidates.sort_by_key(|c| (c.created_at(), c.id()));
                Ok(())
            }
            AllocationStrategy::Lifo => {
                candidates.sort_by_key(|c| (c.created_at(), c.id()));
                candidates.reverse();
                Ok(())
            }
            other => Err(DomainError::validation(format!(
                "allocation strategy '{}' is not available",
                other.as_str()
            ))),
        }
    }
}

impl core::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall result of a reservation request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Success,
    Partial,
    Failed,
}

/// Shortfall description for a product that could not be fully reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub product_id: ProductId,
    pub requested_quantity: i64,
    pub available_quantity: i64,
    pub shortfall: i64,
    pub reason: String,
}

/// Quantity to take from one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedReservation {
    pub item_id: InventoryItemId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPlan {
    pub lines: Vec<PlannedReservation>,
    pub total_requested: i64,
    pub total_reserved: i64,
}

impl ReservationPlan {
    pub fn shortfall(&self) -> i64 {
        self.total_requested - self.total_reserved
    }

    pub fn status(&self) -> AllocationStatus {
        if self.shortfall() == 0 {
            AllocationStatus::Success
        } else if self.total_reserved > 0 {
            AllocationStatus::Partial
        } else {
            AllocationStatus::Failed
        }
    }
}

/// Greedily draw `requested` units from `ordered` rows, first row first.
///
/// Without `allow_partial`, a request that total availability cannot cover is
/// an error and nothing is planned.
pub fn plan_reservation(
    ordered: &[InventoryItem],
    requested: i64,
    allow_partial: bool,
) -> DomainResult<ReservationPlan> {
    if requested <= 0 {
        return Err(DomainError::validation(format!(
            "requested quantity must be positive, got {requested}"
        )));
    }

    let total_available = ordered
        .iter()
        .fold(0i64, |sum, c| sum.saturating_add(c.available().max(0)));
    if total_available < requested && !allow_partial {
        return Err(DomainError::insufficient(requested, total_available));
    }

    let mut remaining = requested;
    let mut lines = Vec::new();
    for candidate in ordered {
        if remaining == 0 {
            break;
        }
        let take = candidate.available().min(remaining);
        if take <= 0 {
            continue;
        }
        lines.push(PlannedReservation {
            item_id: candidate.id(),
            quantity: take,
        });
        remaining -= take;
    }

    Ok(ReservationPlan {
        lines,
        total_requested: requested,
        total_reserved: requested - remaining,
    })
}
