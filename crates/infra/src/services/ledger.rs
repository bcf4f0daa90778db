//! Inventory ledger: CRUD over stock items plus their movement history.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use brewline_core::{DomainError, Entity, Page, PageRequest, SortKey};
use brewline_inventory::{
    InventoryItem, InventoryItemId, InventoryPatch, NewInventoryItem, StockMovement,
};

use crate::deadline::Deadline;
use crate::error::{During, Operation, ServiceError};
use crate::locked::{abort, update_by_id};
use crate::store::{Storage, UnitOfWork};

/// Sort keys accepted by [`InventoryLedger::list`].
pub const INVENTORY_SORT_KEYS: &[SortKey] = &[
    SortKey::Id,
    SortKey::Name,
    SortKey::Quantity,
    SortKey::Price,
    SortKey::CreatedAt,
    SortKey::UpdatedAt,
];

#[derive(Debug, Clone)]
pub struct InventoryLedger<S> {
    storage: S,
}

impl<S> InventoryLedger<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

impl<S: Storage> InventoryLedger<S> {
    /// Create an item. A positive opening quantity is recorded as a restock.
    #[instrument(skip(self, deadline), fields(name = %new.name), err)]
    pub async fn create(
        &self,
        new: &NewInventoryItem,
        deadline: &Deadline,
    ) -> Result<InventoryItem, ServiceError> {
        let op = Operation::InventoryCreate;
        new.validate().during(op)?;

        deadline
            .run(op, async {
                let mut tx = self.storage.begin(deadline).await.during(op)?;
                let now = Utc::now();
                let item = tx.insert_inventory_item(new, now).await.during(op)?;
                if item.quantity() > Decimal::ZERO {
                    let opening = StockMovement::adjustment(item.id_typed(), item.quantity(), now);
                    tx.record_stock_movement(&opening).await.during(op)?;
                }
                tx.commit().await.during(op)?;

                info!(item_id = %item.id_typed(), "inventory item created");
                Ok(item)
            })
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self, request: &PageRequest) -> Result<Page<InventoryItem>, ServiceError> {
        let op = Operation::InventoryList;
        request.validate(INVENTORY_SORT_KEYS).during(op)?;

        let total = self.storage.inventory_count().await.during(op)?;
        let data = self.storage.inventory_page(request).await.during(op)?;
        Ok(Page::new(request, total, data))
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    pub async fn get(&self, id: InventoryItemId) -> Result<InventoryItem, ServiceError> {
        let op = Operation::InventoryGet;
        self.storage
            .inventory_item(id)
            .await
            .during(op)?
            .ok_or_else(|| ServiceError::new(op, DomainError::not_found(InventoryItem::KIND, id)))
    }

    pub async fn total_count(&self) -> Result<u64, ServiceError> {
        self.storage
            .inventory_count()
            .await
            .during(Operation::InventoryCount)
    }

    /// Apply a partial update. A quantity change is recorded as a restock or
    /// waste movement for the difference.
    #[instrument(skip(self, patch, deadline), fields(item_id = %id), err)]
    pub async fn update(
        &self,
        id: InventoryItemId,
        patch: &InventoryPatch,
        deadline: &Deadline,
    ) -> Result<InventoryItem, ServiceError> {
        update_by_id(
            &self.storage,
            Operation::InventoryUpdate,
            id,
            deadline,
            |item: &mut InventoryItem| patch.apply(item),
        )
        .await
    }

    #[instrument(skip(self, deadline), fields(item_id = %id, amount = %amount), err)]
    pub async fn restock(
        &self,
        id: InventoryItemId,
        amount: Decimal,
        deadline: &Deadline,
    ) -> Result<InventoryItem, ServiceError> {
        update_by_id(
            &self.storage,
            Operation::InventoryRestock,
            id,
            deadline,
            move |item: &mut InventoryItem| item.restock(amount).map(|_| true),
        )
        .await
    }

    /// Delete an item. Refused while any menu item's bill-of-materials uses it.
    #[instrument(skip(self, deadline), fields(item_id = %id), err)]
    pub async fn delete(&self, id: InventoryItemId, deadline: &Deadline) -> Result<(), ServiceError> {
        let op = Operation::InventoryDelete;
        deadline
            .run(op, async {
                let mut tx = self.storage.begin(deadline).await.during(op)?;

                if tx.lock_inventory_item(id).await.during(op)?.is_none() {
                    abort(tx, op).await;
                    return Err(ServiceError::new(
                        op,
                        DomainError::not_found(InventoryItem::KIND, id),
                    ));
                }
                if tx.inventory_item_referenced(id).await.during(op)? {
                    abort(tx, op).await;
                    return Err(ServiceError::new(
                        op,
                        DomainError::conflict(format!(
                            "inventory item {id} is used by a menu item"
                        )),
                    ));
                }

                tx.delete_inventory_item(id).await.during(op)?;
                tx.commit().await.during(op)?;
                info!(item_id = %id, "inventory item deleted");
                Ok(())
            })
            .await
    }

    /// Stock movements of one item, oldest first.
    #[instrument(skip(self), fields(item_id = %id), err)]
    pub async fn history(&self, id: InventoryItemId) -> Result<Vec<StockMovement>, ServiceError> {
        let op = Operation::InventoryHistory;
        if self.storage.inventory_item(id).await.during(op)?.is_none() {
            return Err(ServiceError::new(
                op,
                DomainError::not_found(InventoryItem::KIND, id),
            ));
        }
        self.storage.stock_movements(id).await.during(op)
    }
}
