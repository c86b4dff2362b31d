//! In-memory ledger for tests/dev and single-process deployments.
//!
//! Row locks are a shared set of held item ids guarded by a mutex + condvar.
//! A transaction acquires all rows of one `lock_items` call at once (or waits),
//! so two transactions can never each hold half of the other's rows. Writes
//! are staged per transaction and applied together at commit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use stockflow_automation::IdempotencyKey;
use stockflow_core::{InventoryItemId, LocationId, ReservationId, WarehouseId};
use stockflow_inventory::{InventoryItem, InventoryTransaction, Reservation};

use super::results::{AllocationResult, InMemoryAllocationResults};
use super::{InventoryLedger, ItemQuery, LedgerError, LedgerTransaction};

#[derive(Debug, Default)]
struct LedgerState {
    items: HashMap<InventoryItemId, InventoryItem>,
    reservations: HashMap<ReservationId, Reservation>,
    transactions: Vec<InventoryTransaction>,
    warehouses: HashMap<LocationId, WarehouseId>,
}

impl LedgerState {
    fn matches(&self, query: &ItemQuery, item: &InventoryItem) -> bool {
        item.product_id() == query.product_id
            && query.location_id.is_none_or(|l| item.location_id() == l)
            && query
                .warehouse_id
                .is_none_or(|w| self.warehouses.get(&item.location_id()) == Some(&w))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    locks: Mutex<HashSet<InventoryItemId>>,
    released: Condvar,
    results: Arc<InMemoryAllocationResults>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Result store that commits atomically with this ledger's transactions.
    pub fn results(&self) -> Arc<InMemoryAllocationResults> {
        self.results.clone()
    }

    pub fn insert_item(&self, item: InventoryItem) -> Result<(), LedgerError> {
        self.state()?.items.insert(item.id(), item);
        Ok(())
    }

    /// Assign a location to a warehouse for warehouse-scoped queries.
    pub fn assign_location(&self, location_id: LocationId, warehouse_id: WarehouseId) -> Result<(), LedgerError> {
        self.state()?.warehouses.insert(location_id, warehouse_id);
        Ok(())
    }

    pub fn item(&self, id: InventoryItemId) -> Option<InventoryItem> {
        self.state().ok()?.items.get(&id).cloned()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<_> = self
            .state()
            .map(|s| s.reservations.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|r| (r.created_at, r.id));
        all
    }

    pub fn transactions(&self) -> Vec<InventoryTransaction> {
        self.state().map(|s| s.transactions.clone()).unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state.lock().map_err(|_| poisoned())
    }
}

impl InventoryLedger for InMemoryLedger {
    fn find_items(&self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        let state = self.state()?;
        let mut rows: Vec<_> = state
            .items
            .values()
            .filter(|item| state.matches(query, item))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at(), r.id()));
        Ok(rows)
    }

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, LedgerError> {
        Ok(Box::new(InMemoryTransaction {
            ledger: self,
            held: HashSet::new(),
            items: HashMap::new(),
            reservations: HashMap::new(),
            transactions: Vec::new(),
            results: Vec::new(),
        }))
    }

    fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, LedgerError> {
        let state = self.state()?;
        let mut expired: Vec<_> = state
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| (r.expires_at, r.created_at, r.id));
        expired.truncate(limit);
        Ok(expired)
    }
}

struct InMemoryTransaction<'a> {
    ledger: &'a InMemoryLedger,
    held: HashSet<InventoryItemId>,
    items: HashMap<InventoryItemId, InventoryItem>,
    reservations: HashMap<ReservationId, Reservation>,
    transactions: Vec<InventoryTransaction>,
    results: Vec<AllocationResult>,
}

impl InMemoryTransaction<'_> {
    fn acquire(&mut self, ids: &[InventoryItemId]) -> Result<(), LedgerError> {
        let mut locks = self.ledger.locks.lock().map_err(|_| poisoned())?;
        while ids.iter().any(|id| !self.held.contains(id) && locks.contains(id)) {
            locks = self.ledger.released.wait(locks).map_err(|_| poisoned())?;
        }
        for id in ids {
            if locks.insert(*id) {
                self.held.insert(*id);
            }
        }
        Ok(())
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        // Release even through poisoning so waiters are never stranded.
        let mut locks = self.ledger.locks.lock().unwrap_or_else(|p| p.into_inner());
        for id in self.held.drain() {
            locks.remove(&id);
        }
        self.ledger.released.notify_all();
    }

    fn ensure_held(&self, id: InventoryItemId) -> Result<(), LedgerError> {
        if self.held.contains(&id) {
            Ok(())
        } else {
            Err(LedgerError::NotLocked(id))
        }
    }

    fn apply(&mut self) -> Result<(), LedgerError> {
        let ledger = self.ledger;
        let mut state = ledger.state()?;
        ledger.results.insert_batch(std::mem::take(&mut self.results))?;
        for (id, item) in self.items.drain() {
            state.items.insert(id, item);
        }
        for (id, reservation) in self.reservations.drain() {
            state.reservations.insert(id, reservation);
        }
        state.transactions.append(&mut self.transactions);
        Ok(())
    }

    fn current(&self, state: &LedgerState, id: InventoryItemId) -> Option<InventoryItem> {
        self.items.get(&id).or_else(|| state.items.get(&id)).cloned()
    }
}

impl LedgerTransaction for InMemoryTransaction<'_> {
    fn lock_items(&mut self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        let mut ids: Vec<_> = {
            let state = self.ledger.state()?;
            state
                .items
                .values()
                .filter(|item| state.matches(query, item))
                .map(|item| item.id())
                .collect()
        };
        ids.sort();
        self.acquire(&ids)?;

        let state = self.ledger.state()?;
        let mut rows: Vec<_> = ids.iter().filter_map(|id| self.current(&state, *id)).collect();
        rows.sort_by_key(|r| (r.created_at(), r.id()));
        Ok(rows)
    }

    fn lock_item(&mut self, id: InventoryItemId) -> Result<Option<InventoryItem>, LedgerError> {
        if !self.ledger.state()?.items.contains_key(&id) {
            return Ok(None);
        }
        self.acquire(&[id])?;
        let state = self.ledger.state()?;
        Ok(self.current(&state, id))
    }

    fn update_item(&mut self, item: &InventoryItem) -> Result<(), LedgerError> {
        self.ensure_held(item.id())?;
        item.counts().check()?;
        self.items.insert(item.id(), item.clone());
        Ok(())
    }

    fn reservations_for_item(&mut self, item_id: InventoryItemId) -> Result<Vec<Reservation>, LedgerError> {
        self.ensure_held(item_id)?;
        let state = self.ledger.state()?;
        let mut merged: HashMap<ReservationId, Reservation> = state
            .reservations
            .values()
            .filter(|r| r.item_id == item_id)
            .map(|r| (r.id, r.clone()))
            .collect();
        for staged in self.reservations.values().filter(|r| r.item_id == item_id) {
            merged.insert(staged.id, staged.clone());
        }
        let mut rows: Vec<_> = merged.into_values().collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        Ok(rows)
    }

    fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), LedgerError> {
        self.ensure_held(reservation.item_id)?;
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), LedgerError> {
        self.insert_reservation(reservation)
    }

    fn insert_transaction(&mut self, transaction: &InventoryTransaction) -> Result<(), LedgerError> {
        self.transactions.push(transaction.clone());
        Ok(())
    }

    fn record_result(&mut self, key: &IdempotencyKey, result: &serde_json::Value) -> Result<(), LedgerError> {
        self.results.push(AllocationResult::new(key.clone(), result.clone()));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), LedgerError> {
        let outcome = self.apply();
        self.release_locks();
        outcome
    }

    fn rollback(mut self: Box<Self>) -> Result<(), LedgerError> {
        self.release_locks();
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        self.release_locks();
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Storage("ledger lock poisoned".into())
}
