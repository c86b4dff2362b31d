//! Postgres-backed inventory ledger.
//!
//! ## Tables
//!
//! | table | role |
//! |-------|------|
//! | `inventory_items` | stock rows (`quantity`, `reserved_quantity`, `allocated_quantity`, planning levels) |
//! | `inventory_locations` | `id -> warehouse_id` for warehouse-scoped queries |
//! | `inventory_reservations` | reservation records with `remaining` and `expires_at` |
//! | `inventory_transactions` | immutable inbound movement records |
//! | `allocation_results` | write-once idempotency results (unique `idempotency_key`) |
//!
//! Row locks are `SELECT ... FOR UPDATE` taken in id order inside one
//! database transaction. The [`InventoryLedger`] trait is synchronous; each
//! call runs its query on the runtime handle the ledger was built with, so
//! callers must be plain threads rather than runtime workers.
//!
//! ## Error Mapping
//!
//! | SQLx error | LedgerError |
//! |------------|-------------|
//! | unique violation (`23505`) on `allocation_results` | `DuplicateKey` |
//! | pool closed / timed out, IO | `Unavailable` |
//! | anything else | `Storage` |

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use stockflow_automation::IdempotencyKey;
use stockflow_core::{InventoryItemId, LocationId, ProductId, ReservationId};
use stockflow_inventory::{InventoryItem, InventoryTransaction, Reservation, StockCounts, StockLevels};

use super::results::PostgresAllocationResults;
use super::{InventoryLedger, ItemQuery, LedgerError, LedgerTransaction};

const ITEM_COLUMNS: &str = r#"
    i.id, i.product_id, i.location_id,
    i.quantity, i.reserved_quantity, i.allocated_quantity,
    i.minimum_stock, i.maximum_stock, i.reorder_point, i.safety_stock, i.avg_daily_usage,
    i.created_at, i.updated_at
"#;

const RESERVATION_COLUMNS: &str = r#"
    id, idempotency_key, inventory_item_id, product_id, location_id,
    quantity, remaining, reference_id, reference_type, status, expires_at, created_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresLedger {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Result store over the same pool.
    pub fn results(&self) -> PostgresAllocationResults {
        PostgresAllocationResults::new((*self.pool).clone(), self.handle.clone())
    }

    #[instrument(skip(self), fields(product_id = %query.product_id), err)]
    pub async fn load_items(&self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM inventory_items i
            LEFT JOIN inventory_locations l ON l.id = i.location_id
            WHERE i.product_id = $1
              AND ($2::uuid IS NULL OR i.location_id = $2)
              AND ($3::uuid IS NULL OR l.warehouse_id = $3)
            ORDER BY i.created_at ASC, i.id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.product_id.as_uuid())
            .bind(query.location_id.map(Uuid::from))
            .bind(query.warehouse_id.map(Uuid::from))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_items", e))?;
        rows.iter().map(item_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn load_expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM inventory_reservations
            WHERE status = 'active' AND expires_at <= $1
            ORDER BY expires_at ASC, created_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_expired_reservations", e))?;
        rows.iter().map(reservation_from_row).collect()
    }
}

impl InventoryLedger for PostgresLedger {
    fn find_items(&self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        self.handle.block_on(self.load_items(query))
    }

    fn begin(&self) -> Result<Box<dyn LedgerTransaction + '_>, LedgerError> {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgLedgerTransaction {
            tx: Some(tx),
            handle: self.handle.clone(),
            held: HashSet::new(),
        }))
    }

    fn expired_reservations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, LedgerError> {
        self.handle.block_on(self.load_expired_reservations(now, limit))
    }
}

struct PgLedgerTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    handle: Handle,
    held: HashSet<InventoryItemId>,
}

impl PgLedgerTransaction {
    fn parts(&mut self) -> Result<(Handle, &mut Transaction<'static, Postgres>), LedgerError> {
        let handle = self.handle.clone();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| LedgerError::Storage("transaction already finished".into()))?;
        Ok((handle, tx))
    }

    fn ensure_held(&self, id: InventoryItemId) -> Result<(), LedgerError> {
        if self.held.contains(&id) {
            Ok(())
        } else {
            Err(LedgerError::NotLocked(id))
        }
    }

    fn execute(&mut self, operation: &'static str, query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>) -> Result<(), LedgerError> {
        let (handle, tx) = self.parts()?;
        handle
            .block_on(query.execute(&mut **tx))
            .map(|_| ())
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

impl LedgerTransaction for PgLedgerTransaction {
    fn lock_items(&mut self, query: &ItemQuery) -> Result<Vec<InventoryItem>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM inventory_items i
            LEFT JOIN inventory_locations l ON l.id = i.location_id
            WHERE i.product_id = $1
              AND ($2::uuid IS NULL OR i.location_id = $2)
              AND ($3::uuid IS NULL OR l.warehouse_id = $3)
            ORDER BY i.id ASC
            FOR UPDATE OF i
            "#
        );
        let (handle, tx) = self.parts()?;
        let rows = handle
            .block_on(
                sqlx::query(&sql)
                    .bind(query.product_id.as_uuid())
                    .bind(query.location_id.map(Uuid::from))
                    .bind(query.warehouse_id.map(Uuid::from))
                    .fetch_all(&mut **tx),
            )
            .map_err(|e| map_sqlx_error("lock_items", e))?;

        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
        self.held.extend(items.iter().map(|i| i.id()));
        items.sort_by_key(|i| (i.created_at(), i.id()));
        Ok(items)
    }

    fn lock_item(&mut self, id: InventoryItemId) -> Result<Option<InventoryItem>, LedgerError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM inventory_items i WHERE i.id = $1 FOR UPDATE");
        let (handle, tx) = self.parts()?;
        let row = handle
            .block_on(sqlx::query(&sql).bind(id.as_uuid()).fetch_optional(&mut **tx))
            .map_err(|e| map_sqlx_error("lock_item", e))?;
        let item = row.as_ref().map(item_from_row).transpose()?;
        if item.is_some() {
            self.held.insert(id);
        }
        Ok(item)
    }

    fn update_item(&mut self, item: &InventoryItem) -> Result<(), LedgerError> {
        self.ensure_held(item.id())?;
        let counts = item.counts();
        counts.check()?;
        self.execute(
            "update_item",
            sqlx::query(
                r#"
                UPDATE inventory_items
                SET quantity = $2, reserved_quantity = $3, allocated_quantity = $4, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(item.id().as_uuid())
            .bind(counts.quantity)
            .bind(counts.reserved)
            .bind(counts.allocated)
            .bind(item.updated_at()),
        )
    }

    fn reservations_for_item(&mut self, item_id: InventoryItemId) -> Result<Vec<Reservation>, LedgerError> {
        self.ensure_held(item_id)?;
        let sql = format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM inventory_reservations
            WHERE inventory_item_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        );
        let (handle, tx) = self.parts()?;
        let rows = handle
            .block_on(sqlx::query(&sql).bind(item_id.as_uuid()).fetch_all(&mut **tx))
            .map_err(|e| map_sqlx_error("reservations_for_item", e))?;
        rows.iter().map(reservation_from_row).collect()
    }

    fn insert_reservation(&mut self, r: &Reservation) -> Result<(), LedgerError> {
        self.ensure_held(r.item_id)?;
        self.execute(
            "insert_reservation",
            sqlx::query(
                r#"
                INSERT INTO inventory_reservations (
                    id, idempotency_key, inventory_item_id, product_id, location_id,
                    quantity, remaining, reference_id, reference_type, status, expires_at, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(r.id.as_uuid())
            .bind(&r.idempotency_key)
            .bind(r.item_id.as_uuid())
            .bind(r.product_id.as_uuid())
            .bind(r.location_id.as_uuid())
            .bind(r.quantity)
            .bind(r.remaining)
            .bind(&r.reference_id)
            .bind(&r.reference_type)
            .bind(r.status.as_str())
            .bind(r.expires_at)
            .bind(r.created_at),
        )
    }

    fn update_reservation(&mut self, r: &Reservation) -> Result<(), LedgerError> {
        self.ensure_held(r.item_id)?;
        self.execute(
            "update_reservation",
            sqlx::query("UPDATE inventory_reservations SET remaining = $2, status = $3 WHERE id = $1")
                .bind(r.id.as_uuid())
                .bind(r.remaining)
                .bind(r.status.as_str()),
        )
    }

    fn insert_transaction(&mut self, t: &InventoryTransaction) -> Result<(), LedgerError> {
        self.execute(
            "insert_transaction",
            sqlx::query(
                r#"
                INSERT INTO inventory_transactions (
                    id, product_id, location_id, user_id, transaction_type,
                    quantity, reference_number, notes, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(t.id.as_uuid())
            .bind(t.product_id.as_uuid())
            .bind(t.location_id.as_uuid())
            .bind(t.user_id.as_uuid())
            .bind(t.transaction_type.as_str())
            .bind(t.quantity)
            .bind(&t.reference_number)
            .bind(&t.notes)
            .bind(t.created_at),
        )
    }

    fn record_result(&mut self, key: &IdempotencyKey, result: &serde_json::Value) -> Result<(), LedgerError> {
        let (handle, tx) = self.parts()?;
        // Blocks on a concurrent uncommitted insert of the same key; fails
        // with a unique violation if that one commits.
        handle
            .block_on(
                sqlx::query(
                    "INSERT INTO allocation_results (idempotency_key, result, created_at) VALUES ($1, $2, NOW())",
                )
                .bind(key.as_str())
                .bind(result)
                .execute(&mut **tx),
            )
            .map(|_| ())
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::DuplicateKey(key.to_string())
                } else {
                    map_sqlx_error("record_result", e)
                }
            })
    }

    fn commit(mut self: Box<Self>) -> Result<(), LedgerError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerError::Storage("transaction already finished".into()))?;
        self.handle.block_on(tx.commit()).map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::DuplicateKey("allocation result committed concurrently".into())
            } else {
                map_sqlx_error("commit_transaction", e)
            }
        })
    }

    fn rollback(mut self: Box<Self>) -> Result<(), LedgerError> {
        match self.tx.take() {
            Some(tx) => self
                .handle
                .block_on(tx.rollback())
                .map_err(|e| map_sqlx_error("rollback_transaction", e)),
            None => Ok(()),
        }
    }
}

fn item_from_row(row: &PgRow) -> Result<InventoryItem, LedgerError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_inventory_item", e);
    let counts = StockCounts::new(
        row.try_get("quantity").map_err(decode)?,
        row.try_get("reserved_quantity").map_err(decode)?,
        row.try_get("allocated_quantity").map_err(decode)?,
    )?;
    let levels = StockLevels {
        minimum_stock: row.try_get("minimum_stock").map_err(decode)?,
        maximum_stock: row.try_get("maximum_stock").map_err(decode)?,
        reorder_point: row.try_get("reorder_point").map_err(decode)?,
        safety_stock: row.try_get("safety_stock").map_err(decode)?,
        avg_daily_usage: row.try_get("avg_daily_usage").map_err(decode)?,
    };
    let item = InventoryItem::restore(
        InventoryItemId::from_uuid(row.try_get("id").map_err(decode)?),
        ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
        LocationId::from_uuid(row.try_get("location_id").map_err(decode)?),
        counts,
        levels,
        row.try_get("created_at").map_err(decode)?,
        row.try_get("updated_at").map_err(decode)?,
    )?;
    Ok(item)
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, LedgerError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_reservation", e);
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get("id").map_err(decode)?),
        idempotency_key: row.try_get("idempotency_key").map_err(decode)?,
        item_id: InventoryItemId::from_uuid(row.try_get("inventory_item_id").map_err(decode)?),
        product_id: ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
        location_id: LocationId::from_uuid(row.try_get("location_id").map_err(decode)?),
        quantity: row.try_get("quantity").map_err(decode)?,
        remaining: row.try_get("remaining").map_err(decode)?,
        reference_id: row.try_get("reference_id").map_err(decode)?,
        reference_type: row.try_get("reference_type").map_err(decode)?,
        status: status.parse()?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map SQLx errors to LedgerError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::DuplicateKey(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            LedgerError::Unavailable(format!("{operation}: {err}"))
        }
        other => LedgerError::Storage(format!("{operation}: {other}")),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
