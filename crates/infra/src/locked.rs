//! Locked read-modify-write of a single record.
//!
//! Every field update and every status change goes through [`update_by_id`]:
//!
//! ```text
//! begin unit of work (bounded by the request deadline)
//!   ↓
//! 1. Lock the row; a missing row is NotFound
//!   ↓
//! 2. Apply the mutation to an owned copy
//!   ↓
//! 3. Nothing changed? roll back, no_fields_updated
//!   ↓
//! 4. Stamp updated_at, write the row and its side records
//!   ↓
//! commit
//! ```
//!
//! Two concurrent callers on the same row serialize on the lock, so the
//! second one always sees the first one's committed result.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use brewline_core::{DomainError, DomainResult, Entity, Timestamped};
use brewline_inventory::{InventoryItem, StockMovement};
use brewline_menu::{MenuItem, PriceChange};
use brewline_orders::{Order, StatusChange};

use crate::deadline::Deadline;
use crate::error::{During, Operation, ServiceError};
use crate::store::{Storage, StoreResult, UnitOfWork};

/// A record that can be locked and rewritten inside a unit of work.
#[async_trait]
pub trait Lockable: Entity + Timestamped + Clone + Send + Sync + 'static {
    /// Read the row under an exclusive lock.
    async fn lock<U: UnitOfWork>(tx: &mut U, id: Self::Id) -> StoreResult<Option<Self>>;

    /// Persist `after`, plus whatever audit rows the change from `before` implies.
    async fn write<U: UnitOfWork>(tx: &mut U, before: &Self, after: &Self) -> StoreResult<()>;
}

#[async_trait]
impl Lockable for InventoryItem {
    async fn lock<U: UnitOfWork>(tx: &mut U, id: Self::Id) -> StoreResult<Option<Self>> {
        tx.lock_inventory_item(id).await
    }

    async fn write<U: UnitOfWork>(tx: &mut U, before: &Self, after: &Self) -> StoreResult<()> {
        tx.update_inventory_item(after).await?;
        let delta = after.quantity() - before.quantity();
        if !delta.is_zero() {
            let movement = StockMovement::adjustment(after.id_typed(), delta, after.updated_at());
            tx.record_stock_movement(&movement).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Lockable for MenuItem {
    async fn lock<U: UnitOfWork>(tx: &mut U, id: Self::Id) -> StoreResult<Option<Self>> {
        tx.lock_menu_item(id).await
    }

    async fn write<U: UnitOfWork>(tx: &mut U, before: &Self, after: &Self) -> StoreResult<()> {
        tx.update_menu_item(after).await?;
        if let Some(change) = PriceChange::between(before, after) {
            tx.record_price_change(&change).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Lockable for Order {
    async fn lock<U: UnitOfWork>(tx: &mut U, id: Self::Id) -> StoreResult<Option<Self>> {
        tx.lock_order(id).await
    }

    async fn write<U: UnitOfWork>(tx: &mut U, before: &Self, after: &Self) -> StoreResult<()> {
        tx.update_order(after).await?;
        if before.status() != after.status() {
            let change = StatusChange {
                order_id: after.id_typed(),
                previous: before.status(),
                next: after.status(),
                changed_at: after.updated_at(),
            };
            tx.record_status_change(&change).await?;
        }
        Ok(())
    }
}

/// Lock the record with `id`, apply `mutate`, and commit if anything changed.
///
/// `mutate` returns whether it changed the record. It runs while the lock is
/// held and must not block. Any error it returns aborts the unit of work with
/// nothing written.
pub async fn update_by_id<S, T, F>(
    storage: &S,
    operation: Operation,
    id: T::Id,
    deadline: &Deadline,
    mutate: F,
) -> Result<T, ServiceError>
where
    S: Storage,
    T: Lockable,
    F: FnOnce(&mut T) -> DomainResult<bool> + Send,
{
    deadline
        .run(operation, async move {
            let mut tx = storage.begin(deadline).await.during(operation)?;

            let Some(before) = T::lock(&mut tx, id).await.during(operation)? else {
                abort(tx, operation).await;
                return Err(ServiceError::new(
                    operation,
                    DomainError::not_found(T::KIND, id),
                ));
            };

            let mut after = before.clone();
            let changed = match mutate(&mut after) {
                Ok(changed) => changed,
                Err(err) => {
                    abort(tx, operation).await;
                    return Err(ServiceError::new(operation, err));
                }
            };
            if !changed {
                abort(tx, operation).await;
                return Err(ServiceError::new(operation, DomainError::no_fields_updated()));
            }

            after.touch(Utc::now());
            T::write(&mut tx, &before, &after).await.during(operation)?;
            tx.commit().await.during(operation)?;

            debug!(%operation, kind = T::KIND, id = ?id, "record updated");
            Ok(after)
        })
        .await
}

/// Roll back after a deterministic failure. A rollback error is only logged;
/// the caller already has the error worth reporting.
pub(crate) async fn abort<U: UnitOfWork>(tx: U, operation: Operation) {
    if let Err(err) = tx.rollback().await {
        warn!(%operation, error = %err, "rollback failed");
    }
}
