//! Order fulfillment engine.
//!
//! Placing an order checks and decrements stock for every ingredient the order
//! consumes in a single unit of work:
//!
//! ```text
//! validate request
//!   ↓
//! 1. Resolve menu items (non-locking read), snapshot names and prices
//!   ↓
//! 2. Aggregate consumption per ingredient (ascending id)
//!   ↓
//! 3. Lock each ingredient row in that order, check availability
//!   ↓
//! 4. Insert order + lines, decrement stock, record usage
//!   ↓
//! commit
//! ```
//!
//! Any failure before the commit leaves every table untouched. Orders whose
//! ingredient sets are disjoint never wait on each other; overlapping ones
//! queue at the first shared row lock.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, instrument};

use brewline_core::{DomainError, Entity, Page, PageRequest, SortKey};
use brewline_inventory::{InventoryItem, StockMovement};
use brewline_menu::{MenuItem, MenuItemId};
use brewline_orders::{Order, OrderId, OrderStatus, PlaceOrder, StatusChange};

use crate::deadline::Deadline;
use crate::error::{During, Operation, ServiceError};
use crate::locked::{abort, update_by_id};
use crate::store::{Storage, UnitOfWork};

pub const ORDER_SORT_KEYS: &[SortKey] = &[
    SortKey::Id,
    SortKey::Total,
    SortKey::CreatedAt,
    SortKey::UpdatedAt,
];

#[derive(Debug, Clone)]
pub struct OrderFulfillment<S> {
    storage: S,
}

impl<S> OrderFulfillment<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

impl<S: Storage> OrderFulfillment<S> {
    /// Place an order, consuming stock for every line.
    ///
    /// Returns the committed order with status `pending`. Fails with
    /// `insufficient_stock` naming the first short ingredient in id order.
    #[instrument(
        skip(self, request, deadline),
        fields(lines = request.lines.len()),
        err
    )]
    pub async fn create_order(
        &self,
        request: &PlaceOrder,
        deadline: &Deadline,
    ) -> Result<Order, ServiceError> {
        let op = Operation::OrderCreate;
        let validated = request.validate().during(op)?;

        deadline
            .run(op, async move {
                let menus: BTreeMap<MenuItemId, MenuItem> = self
                    .storage
                    .menu_items(&validated.menu_item_ids())
                    .await
                    .during(op)?
                    .into_iter()
                    .map(|item| (item.id_typed(), item))
                    .collect();
                let (new_order, consumption) = validated.price(&menus).during(op)?;

                let mut tx = self.storage.begin(deadline).await.during(op)?;

                for (ingredient_id, required) in consumption.iter() {
                    let Some(item) = tx.lock_inventory_item(ingredient_id).await.during(op)? else {
                        abort(tx, op).await;
                        return Err(ServiceError::new(
                            op,
                            DomainError::not_found(InventoryItem::KIND, ingredient_id),
                        ));
                    };
                    if let Err(err) = item.ensure_available(required) {
                        abort(tx, op).await;
                        return Err(ServiceError::new(op, err));
                    }
                }

                let now = Utc::now();
                let order = tx.insert_order(&new_order, now).await.during(op)?;
                let order_ref: i64 = order.id_typed().into();
                for (ingredient_id, amount) in consumption.iter() {
                    tx.decrement_inventory(ingredient_id, amount, now)
                        .await
                        .during(op)?;
                    tx.record_stock_movement(&StockMovement::usage(
                        ingredient_id,
                        amount,
                        order_ref,
                        now,
                    ))
                    .await
                    .during(op)?;
                }
                tx.commit().await.during(op)?;

                info!(
                    order_id = %order.id_typed(),
                    total = %order.total(),
                    ingredients = consumption.len(),
                    "order placed"
                );
                Ok(order)
            })
            .await
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn get(&self, id: OrderId) -> Result<Order, ServiceError> {
        let op = Operation::OrderGet;
        self.storage
            .order(id)
            .await
            .during(op)?
            .ok_or_else(|| ServiceError::new(op, DomainError::not_found(Order::KIND, id)))
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self, request: &PageRequest) -> Result<Page<Order>, ServiceError> {
        let op = Operation::OrderList;
        request.validate(ORDER_SORT_KEYS).during(op)?;

        let total = self.storage.order_count().await.during(op)?;
        let data = self.storage.order_page(request).await.during(op)?;
        Ok(Page::new(request, total, data))
    }

    /// Move an order to `target` if the lifecycle allows it.
    #[instrument(skip(self, deadline), fields(order_id = %id, target = %target), err)]
    pub async fn advance(
        &self,
        id: OrderId,
        target: OrderStatus,
        deadline: &Deadline,
    ) -> Result<Order, ServiceError> {
        self.transition(Operation::OrderAdvance, id, target, deadline)
            .await
    }

    pub async fn close(&self, id: OrderId, deadline: &Deadline) -> Result<Order, ServiceError> {
        self.transition(Operation::OrderClose, id, OrderStatus::Completed, deadline)
            .await
    }

    /// Cancel an order. Consumed stock is not returned.
    pub async fn cancel(&self, id: OrderId, deadline: &Deadline) -> Result<Order, ServiceError> {
        self.transition(Operation::OrderCancel, id, OrderStatus::Cancelled, deadline)
            .await
    }

    /// Status changes of one order, oldest first.
    #[instrument(skip(self), fields(order_id = %id), err)]
    pub async fn history(&self, id: OrderId) -> Result<Vec<StatusChange>, ServiceError> {
        let op = Operation::OrderHistory;
        if self.storage.order(id).await.during(op)?.is_none() {
            return Err(ServiceError::new(op, DomainError::not_found(Order::KIND, id)));
        }
        self.storage.status_history(id).await.during(op)
    }

    async fn transition(
        &self,
        op: Operation,
        id: OrderId,
        target: OrderStatus,
        deadline: &Deadline,
    ) -> Result<Order, ServiceError> {
        let order = update_by_id(&self.storage, op, id, deadline, move |order: &mut Order| {
            order.transition_to(target).map(|_| true)
        })
        .await?;

        info!(order_id = %id, status = %order.status(), "order status changed");
        Ok(order)
    }
}
