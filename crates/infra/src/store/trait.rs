use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use brewline_core::PageRequest;
use brewline_inventory::{InventoryItem, InventoryItemId, NewInventoryItem, StockMovement};
use brewline_menu::{MenuItem, MenuItemId, NewMenuItem, PriceChange};
use brewline_orders::{NewOrder, Order, OrderId, StatusChange};

use crate::deadline::Deadline;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage backend failure.
///
/// These are **infrastructure errors** as opposed to domain errors. The
/// service layer turns them into [`crate::ServiceError`] kinds:
///
/// - **Transient**: lock wait timeout, deadlock, serialization failure,
///   cancelled statement, pool exhaustion or lost connection (retryable)
/// - **Conflict**: unique or foreign key violation
/// - **Constraint**: check constraint violation (e.g. negative stock)
/// - **Backend**: anything else, including rows that fail to decode
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// One storage transaction.
///
/// `lock_*` methods take a row lock held until the unit of work is committed,
/// rolled back or dropped; dropping without committing rolls back. Write
/// methods for existing rows require the row to have been locked by this
/// unit of work first.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn lock_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>>;

    async fn insert_inventory_item(
        &mut self,
        new: &NewInventoryItem,
        at: DateTime<Utc>,
    ) -> StoreResult<InventoryItem>;

    /// Persist every mutable field of a locked item in one statement.
    async fn update_inventory_item(&mut self, item: &InventoryItem) -> StoreResult<()>;

    /// Subtract `amount` from a locked item's quantity.
    async fn decrement_inventory(
        &mut self,
        id: InventoryItemId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Whether any menu item's bill-of-materials lists the item.
    async fn inventory_item_referenced(&mut self, id: InventoryItemId) -> StoreResult<bool>;

    async fn delete_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<()>;

    async fn record_stock_movement(&mut self, movement: &StockMovement) -> StoreResult<()>;

    async fn lock_menu_item(&mut self, id: MenuItemId) -> StoreResult<Option<MenuItem>>;

    async fn insert_menu_item(&mut self, new: &NewMenuItem, at: DateTime<Utc>) -> StoreResult<MenuItem>;

    async fn update_menu_item(&mut self, item: &MenuItem) -> StoreResult<()>;

    async fn delete_menu_item(&mut self, id: MenuItemId) -> StoreResult<()>;

    async fn record_price_change(&mut self, change: &PriceChange) -> StoreResult<()>;

    /// Insert an order and its lines with status `pending`.
    async fn insert_order(&mut self, new: &NewOrder, at: DateTime<Utc>) -> StoreResult<Order>;

    async fn lock_order(&mut self, id: OrderId) -> StoreResult<Option<Order>>;

    async fn update_order(&mut self, order: &Order) -> StoreResult<()>;

    async fn record_status_change(&mut self, change: &StatusChange) -> StoreResult<()>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Storage boundary: opens units of work and serves non-locking reads.
///
/// Non-locking reads see committed state only. List reads return one page in
/// the order given by the request's sort key, ties broken by id.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    type Tx: UnitOfWork + 'static;

    /// Open a unit of work bounded by `deadline`.
    async fn begin(&self, deadline: &Deadline) -> StoreResult<Self::Tx>;

    async fn inventory_item(&self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>>;

    async fn inventory_page(&self, request: &PageRequest) -> StoreResult<Vec<InventoryItem>>;

    async fn inventory_count(&self) -> StoreResult<u64>;

    /// Movements of one item, oldest first.
    async fn stock_movements(&self, id: InventoryItemId) -> StoreResult<Vec<StockMovement>>;

    async fn menu_item(&self, id: MenuItemId) -> StoreResult<Option<MenuItem>>;

    /// The subset of `ids` that exist.
    async fn menu_items(&self, ids: &[MenuItemId]) -> StoreResult<Vec<MenuItem>>;

    async fn menu_page(&self, request: &PageRequest) -> StoreResult<Vec<MenuItem>>;

    async fn menu_count(&self) -> StoreResult<u64>;

    /// Price edits of one menu item, oldest first.
    async fn price_history(&self, id: MenuItemId) -> StoreResult<Vec<PriceChange>>;

    async fn order(&self, id: OrderId) -> StoreResult<Option<Order>>;

    async fn order_page(&self, request: &PageRequest) -> StoreResult<Vec<Order>>;

    async fn order_count(&self) -> StoreResult<u64>;

    /// Status changes of one order, oldest first.
    async fn status_history(&self, id: OrderId) -> StoreResult<Vec<StatusChange>>;
}
