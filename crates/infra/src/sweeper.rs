//! Expired reservation sweep.
//!
//! Reservation expiry is advisory until swept: the sweep releases whatever an
//! expired, still-active reservation holds and marks it `expired`, one
//! reservation per transaction.

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use stockflow_inventory::{Reservation, ReservationStatus};

use crate::ledger::{InventoryLedger, LedgerError};

const DEFAULT_BATCH: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub released_quantity: i64,
    /// Already settled by the time it was locked.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReservationSweeper {
    ledger: Arc<dyn InventoryLedger>,
    batch_size: usize,
}

impl ReservationSweeper {
    pub fn new(ledger: Arc<dyn InventoryLedger>) -> Self {
        Self {
            ledger,
            batch_size: DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Release every reservation expired at `now`, up to one batch.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        let candidates = self.ledger.expired_reservations(now, self.batch_size)?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for reservation in candidates {
            match self.expire(&reservation, now) {
                Ok(Some(released)) => {
                    report.expired += 1;
                    report.released_quantity += released;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(reservation_id = %reservation.id, error = %e, "failed to expire reservation");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                expired = report.expired,
                released = report.released_quantity,
                skipped = report.skipped,
                failed = report.failed,
                "reservation sweep finished"
            );
        }
        Ok(report)
    }

    /// Returns the released quantity, or `None` if the reservation was
    /// settled concurrently.
    fn expire(&self, candidate: &Reservation, now: DateTime<Utc>) -> Result<Option<i64>, LedgerError> {
        let mut tx = self.ledger.begin()?;

        let Some(mut item) = tx.lock_item(candidate.item_id)? else {
            tx.rollback()?;
            return Ok(None);
        };
        let current = tx
            .reservations_for_item(item.id())?
            .into_iter()
            .find(|r| r.id == candidate.id);
        let Some(mut reservation) = current.filter(|r| r.is_expired(now)) else {
            tx.rollback()?;
            return Ok(None);
        };

        // Reserved stock may already have been drawn down without a matching
        // reservation record; never release more than the row holds.
        let released = reservation.remaining.min(item.reserved_quantity());
        if released > 0 {
            item.release(released)?;
            tx.update_item(&item)?;
        }
        reservation.remaining = 0;
        reservation.status = ReservationStatus::Expired;
        tx.update_reservation(&reservation)?;
        tx.commit()?;

        debug!(reservation_id = %reservation.id, item_id = %item.id(), released, "reservation expired");
        Ok(Some(released))
    }

    /// Sweep every `interval` on a dedicated thread.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> io::Result<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("reservation-sweeper".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "reservation sweeper started");
                loop {
                    if let Err(e) = self.sweep(Utc::now()) {
                        error!(error = %e, "reservation sweep failed");
                    }
                    match shutdown_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                info!("reservation sweeper stopped");
            })?;
        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use chrono::Duration as ChronoDuration;
    use stockflow_core::{LocationId, ProductId, ReservationId};
    use stockflow_inventory::InventoryItem;

    fn reserve(ledger: &InMemoryLedger, item: &InventoryItem, qty: i64, expires_at: DateTime<Utc>) -> Reservation {
        let mut tx = ledger.begin().unwrap();
        let mut locked = tx.lock_item(item.id()).unwrap().unwrap();
        locked.reserve(qty).unwrap();
        tx.update_item(&locked).unwrap();
        let reservation = Reservation {
            id: ReservationId::new(),
            idempotency_key: format!("key-{qty}"),
            item_id: item.id(),
            product_id: item.product_id(),
            location_id: item.location_id(),
            quantity: qty,
            remaining: qty,
            reference_id: None,
            reference_type: None,
            status: ReservationStatus::Active,
            expires_at,
            created_at: Utc::now(),
        };
        tx.insert_reservation(&reservation).unwrap();
        tx.commit().unwrap();
        reservation
    }

    #[test]
    fn releases_only_expired_reservations() {
        let ledger = InMemoryLedger::arc();
        let item = InventoryItem::new(ProductId::new(), LocationId::new(), 20).unwrap();
        ledger.insert_item(item.clone()).unwrap();
        let now = Utc::now();
        let expired = reserve(&ledger, &item, 5, now - ChronoDuration::hours(1));
        reserve(&ledger, &item, 3, now + ChronoDuration::hours(1));

        let sweeper = ReservationSweeper::new(ledger.clone());
        let report = sweeper.sweep(now).unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.released_quantity, 5);
        assert_eq!(ledger.item(item.id()).unwrap().reserved_quantity(), 3);
        let stored = ledger.reservations().into_iter().find(|r| r.id == expired.id).unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);
        assert_eq!(stored.remaining, 0);

        let again = sweeper.sweep(now).unwrap();
        assert_eq!(again.examined, 0);
    }
}
