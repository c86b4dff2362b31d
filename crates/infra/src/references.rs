//! Read-only lookups of entities owned by other parts of the system.
//!
//! `receive_inventory` resolves the product behind a purchase-order line item
//! through its supplier product. Neither record is written here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use stockflow_core::{EntityId, ProductId, SupplierProductId};

use crate::ledger::LedgerError;
use crate::ledger::postgres::map_sqlx_error;

/// The parts of a purchase-order line item receiving needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoLineItem {
    pub id: EntityId,
    pub supplier_product_id: SupplierProductId,
    pub quantity: i64,
}

pub trait ReferenceLookup: Send + Sync {
    /// Product a supplier product stands for.
    fn supplier_product(&self, id: SupplierProductId) -> Result<Option<ProductId>, LedgerError>;

    fn po_line_item(&self, id: EntityId) -> Result<Option<PoLineItem>, LedgerError>;
}

impl<R> ReferenceLookup for Arc<R>
where
    R: ReferenceLookup + ?Sized,
{
    fn supplier_product(&self, id: SupplierProductId) -> Result<Option<ProductId>, LedgerError> {
        (**self).supplier_product(id)
    }

    fn po_line_item(&self, id: EntityId) -> Result<Option<PoLineItem>, LedgerError> {
        (**self).po_line_item(id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReferences {
    supplier_products: RwLock<HashMap<SupplierProductId, ProductId>>,
    line_items: RwLock<HashMap<EntityId, PoLineItem>>,
}

impl InMemoryReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_supplier_product(&self, id: SupplierProductId, product_id: ProductId) {
        if let Ok(mut map) = self.supplier_products.write() {
            map.insert(id, product_id);
        }
    }

    pub fn add_po_line_item(&self, line_item: PoLineItem) {
        if let Ok(mut map) = self.line_items.write() {
            map.insert(line_item.id, line_item);
        }
    }
}

impl ReferenceLookup for InMemoryReferences {
    fn supplier_product(&self, id: SupplierProductId) -> Result<Option<ProductId>, LedgerError> {
        let map = self
            .supplier_products
            .read()
            .map_err(|_| LedgerError::Storage("reference lock poisoned".into()))?;
        Ok(map.get(&id).copied())
    }

    fn po_line_item(&self, id: EntityId) -> Result<Option<PoLineItem>, LedgerError> {
        let map = self
            .line_items
            .read()
            .map_err(|_| LedgerError::Storage("reference lock poisoned".into()))?;
        Ok(map.get(&id).copied())
    }
}

/// Reads `supplier_products(id, product_id)` and
/// `purchase_order_line_items(id, supplier_product_id, quantity_ordered)`.
#[derive(Debug, Clone)]
pub struct PostgresReferences {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresReferences {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn load_supplier_product(&self, id: SupplierProductId) -> Result<Option<ProductId>, LedgerError> {
        let row = sqlx::query("SELECT product_id FROM supplier_products WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_supplier_product", e))?;

        row.map(|row| {
            row.try_get("product_id")
                .map(ProductId::from_uuid)
                .map_err(|e| map_sqlx_error("decode_supplier_product", e))
        })
        .transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn load_po_line_item(&self, id: EntityId) -> Result<Option<PoLineItem>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, supplier_product_id, quantity_ordered
            FROM purchase_order_line_items
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_po_line_item", e))?;

        row.map(|row| -> Result<PoLineItem, LedgerError> {
            let decode = |e: sqlx::Error| map_sqlx_error("decode_po_line_item", e);
            Ok(PoLineItem {
                id: EntityId::from_uuid(row.try_get("id").map_err(decode)?),
                supplier_product_id: SupplierProductId::from_uuid(row.try_get("supplier_product_id").map_err(decode)?),
                quantity: row.try_get("quantity_ordered").map_err(decode)?,
            })
        })
        .transpose()
    }
}

impl ReferenceLookup for PostgresReferences {
    fn supplier_product(&self, id: SupplierProductId) -> Result<Option<ProductId>, LedgerError> {
        self.handle.block_on(self.load_supplier_product(id))
    }

    fn po_line_item(&self, id: EntityId) -> Result<Option<PoLineItem>, LedgerError> {
        self.handle.block_on(self.load_po_line_item(id))
    }
}
