//! Write-once idempotency results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use stockflow_automation::IdempotencyKey;

use super::LedgerError;
use super::postgres::{is_unique_violation, map_sqlx_error};

/// Outcome stored once per idempotency key and replayed verbatim afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub idempotency_key: IdempotencyKey,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AllocationResult {
    pub fn new(idempotency_key: IdempotencyKey, result: serde_json::Value) -> Self {
        Self {
            idempotency_key,
            result,
            created_at: Utc::now(),
        }
    }
}

pub trait AllocationResultStore: Send + Sync {
    fn get(&self, key: &IdempotencyKey) -> Result<Option<AllocationResult>, LedgerError>;

    /// First write wins; returns whichever row is stored after the call.
    fn put_if_absent(&self, key: &IdempotencyKey, result: serde_json::Value) -> Result<AllocationResult, LedgerError>;
}

impl<S> AllocationResultStore for Arc<S>
where
    S: AllocationResultStore + ?Sized,
{
    fn get(&self, key: &IdempotencyKey) -> Result<Option<AllocationResult>, LedgerError> {
        (**self).get(key)
    }

    fn put_if_absent(&self, key: &IdempotencyKey, result: serde_json::Value) -> Result<AllocationResult, LedgerError> {
        (**self).put_if_absent(key, result)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAllocationResults {
    rows: RwLock<HashMap<IdempotencyKey, AllocationResult>>,
}

impl InMemoryAllocationResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert every row or none: any key already present fails the batch.
    pub(crate) fn insert_batch(&self, batch: Vec<AllocationResult>) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if let Some(taken) = batch.iter().find(|r| rows.contains_key(&r.idempotency_key)) {
            return Err(LedgerError::DuplicateKey(taken.idempotency_key.to_string()));
        }
        for row in batch {
            rows.insert(row.idempotency_key.clone(), row);
        }
        Ok(())
    }
}

impl AllocationResultStore for InMemoryAllocationResults {
    fn get(&self, key: &IdempotencyKey) -> Result<Option<AllocationResult>, LedgerError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(key).cloned())
    }

    fn put_if_absent(&self, key: &IdempotencyKey, result: serde_json::Value) -> Result<AllocationResult, LedgerError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        Ok(rows
            .entry(key.clone())
            .or_insert_with(|| AllocationResult::new(key.clone(), result))
            .clone())
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Storage("allocation result lock poisoned".into())
}

/// `allocation_results(idempotency_key TEXT PRIMARY KEY, result JSONB, created_at TIMESTAMPTZ)`.
#[derive(Debug, Clone)]
pub struct PostgresAllocationResults {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresAllocationResults {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn load(&self, key: &IdempotencyKey) -> Result<Option<AllocationResult>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, result, created_at
            FROM allocation_results
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_allocation_result", e))?;

        row.map(|row| -> Result<AllocationResult, LedgerError> {
            Ok(AllocationResult {
                idempotency_key: IdempotencyKey::from_stored(
                    row.try_get::<String, _>("idempotency_key")
                        .map_err(|e| map_sqlx_error("decode_allocation_result", e))?,
                ),
                result: row
                    .try_get("result")
                    .map_err(|e| map_sqlx_error("decode_allocation_result", e))?,
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| map_sqlx_error("decode_allocation_result", e))?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, result), fields(key = %key), err)]
    pub async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        result: serde_json::Value,
    ) -> Result<AllocationResult, LedgerError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO allocation_results (idempotency_key, result, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(&result)
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {}
            Err(e) => return Err(map_sqlx_error("insert_allocation_result", e)),
        }

        self.load(key)
            .await?
            .ok_or_else(|| LedgerError::Storage(format!("allocation result {key} vanished after insert")))
    }
}

impl AllocationResultStore for PostgresAllocationResults {
    fn get(&self, key: &IdempotencyKey) -> Result<Option<AllocationResult>, LedgerError> {
        self.handle.block_on(self.load(key))
    }

    fn put_if_absent(&self, key: &IdempotencyKey, result: serde_json::Value) -> Result<AllocationResult, LedgerError> {
        self.handle.block_on(self.insert_if_absent(key, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockflow_core::ExecutionId;

    fn key() -> IdempotencyKey {
        IdempotencyKey::new(ExecutionId::new(), None, "reserve_inventory")
    }

    #[test]
    fn first_write_wins() {
        let store = InMemoryAllocationResults::new();
        let key = key();

        let first = store.put_if_absent(&key, json!({"n": 1})).unwrap();
        let second = store.put_if_absent(&key, json!({"n": 2})).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.get(&key).unwrap().unwrap().result, json!({"n": 1}));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let store = InMemoryAllocationResults::new();
        let (taken, fresh) = (key(), key());
        store.put_if_absent(&taken, json!(1)).unwrap();

        let err = store
            .insert_batch(vec![
                AllocationResult::new(fresh.clone(), json!(2)),
                AllocationResult::new(taken.clone(), json!(3)),
            ])
            .unwrap_err();

        assert_eq!(err, LedgerError::DuplicateKey(taken.to_string()));
        assert!(store.get(&fresh).unwrap().is_none());
    }
}
