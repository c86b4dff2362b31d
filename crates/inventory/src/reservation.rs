//! Reservation records: the per-request audit of soft holds.
//!
//! A row's `reserved_quantity` is the sum of what was reserved against it; a
//! reservation record remembers who asked, for what reference, and until when
//! the hold is meant to last. `expires_at` is advisory: the reservation call
//! never enforces it, a sweep does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{InventoryItemId, LocationId, ProductId, ReservationId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = stockflow_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "committed" => Ok(ReservationStatus::Committed),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(stockflow_core::DomainError::validation(format!(
                "unknown reservation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub idempotency_key: String,
    pub item_id: InventoryItemId,
    pub product_id: ProductId,
    pub location_id: LocationId,
    pub quantity: i64,
    /// Portion still held; commit/release/expiry draw this down.
    pub remaining: i64,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at <= now
    }
}

/// Draw `qty` down from active reservations, oldest first.
///
/// Reservations that reach zero take `settled_as` as their final status.
/// Returns how much was matched against reservation records, which may be
/// less than `qty` when stock was reserved outside this bookkeeping.
pub fn consume_reservations(
    reservations: &mut [Reservation],
    mut qty: i64,
    settled_as: ReservationStatus,
) -> i64 {
    reservations.sort_by_key(|r| (r.created_at, r.id));
    let mut matched = 0;
    for reservation in reservations
        .iter_mut()
        .filter(|r| r.status == ReservationStatus::Active)
    {
        if qty == 0 {
            break;
        }
        let take = reservation.remaining.min(qty);
        reservation.remaining -= take;
        if reservation.remaining == 0 {
            reservation.status = settled_as;
        }
        qty -= take;
        matched += take;
    }
    matched
}
