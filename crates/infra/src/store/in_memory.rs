//! In-memory storage backend.
//!
//! Intended for tests/dev. Committed rows live behind a `std::sync::RwLock`;
//! row locks are `tokio::sync::Mutex` guards owned by the unit of work, so a
//! transaction that locks a row makes every other transaction locking the same
//! row wait until it commits, rolls back or is dropped. Writes are staged in
//! the unit of work and applied to the committed tables in one step on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use brewline_core::{Entity, PageRequest, SortKey, Timestamped};
use brewline_inventory::{InventoryItem, InventoryItemId, NewInventoryItem, StockMovement};
use brewline_menu::{MenuItem, MenuItemId, NewMenuItem, PriceChange};
use brewline_orders::{NewOrder, Order, OrderId, StatusChange};

use super::r#trait::{Storage, StoreError, StoreResult, UnitOfWork};
use crate::deadline::Deadline;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Inventory(InventoryItemId),
    Menu(MenuItemId),
    Order(OrderId),
}

#[derive(Debug, Default)]
struct Tables {
    inventory: BTreeMap<InventoryItemId, InventoryItem>,
    menu: BTreeMap<MenuItemId, MenuItem>,
    orders: BTreeMap<OrderId, Order>,
    movements: Vec<StockMovement>,
    price_changes: Vec<PriceChange>,
    status_changes: Vec<StatusChange>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    inventory_seq: AtomicI64,
    menu_seq: AtomicI64,
    order_seq: AtomicI64,
}

impl Shared {
    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| poisoned())
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| poisoned())
    }

    fn row_lock(&self, key: RowKey) -> StoreResult<Arc<RowMutex<()>>> {
        let mut locks = self.row_locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Forget the row locks in `keys` that no unit of work holds or waits on.
    ///
    /// Handles are only cloned under the map lock, so a count of one (the
    /// map's own) cannot change while it is held.
    fn prune_row_locks(&self, keys: &[RowKey]) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for key in keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn row_lock_count(&self) -> usize {
        self.row_locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}

/// Row locks held by one unit of work. Dropping releases them.
struct RowGuards {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl RowGuards {
    fn len(&self) -> usize {
        self.held.len()
    }

    fn contains(&self, key: &RowKey) -> bool {
        self.held.contains_key(key)
    }
}

impl Drop for RowGuards {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.keys().copied().collect();
        self.held.clear();
        self.shared.prune_row_locks(&keys);
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

/// In-memory storage. Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    shared: Arc<Shared>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Comparable projection of a row for one sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Int(i64),
    Text(String),
    Number(Decimal),
    Time(DateTime<Utc>),
}

fn paginate<T, F>(mut rows: Vec<T>, request: &PageRequest, sort_value: F) -> Vec<T>
where
    T: Entity,
    F: Fn(&T, SortKey) -> SortValue,
{
    let key = request.sort_key();
    rows.sort_by(|a, b| {
        let (a_id, b_id): (i64, i64) = ((*a.id()).into(), (*b.id()).into());
        sort_value(a, key)
            .cmp(&sort_value(b, key))
            .then(a_id.cmp(&b_id))
    });
    rows.into_iter()
        .skip(usize::try_from(request.offset()).unwrap_or(usize::MAX))
        .take(usize::try_from(request.limit()).unwrap_or(usize::MAX))
        .collect()
}

fn inventory_sort_value(item: &InventoryItem, key: SortKey) -> SortValue {
    match key {
        SortKey::Name => SortValue::Text(item.name().to_string()),
        SortKey::Quantity => SortValue::Number(item.quantity()),
        SortKey::Price | SortKey::Total => SortValue::Number(item.price()),
        SortKey::CreatedAt => SortValue::Time(item.created_at()),
        SortKey::UpdatedAt => SortValue::Time(item.updated_at()),
        SortKey::Id => SortValue::Int(item.id_typed().get()),
    }
}

fn menu_sort_value(item: &MenuItem, key: SortKey) -> SortValue {
    match key {
        SortKey::Name => SortValue::Text(item.name().to_string()),
        SortKey::Price | SortKey::Total => SortValue::Number(item.price()),
        SortKey::CreatedAt => SortValue::Time(item.created_at()),
        SortKey::UpdatedAt => SortValue::Time(item.updated_at()),
        SortKey::Id | SortKey::Quantity => SortValue::Int(item.id_typed().get()),
    }
}

fn order_sort_value(order: &Order, key: SortKey) -> SortValue {
    match key {
        SortKey::Total | SortKey::Price => SortValue::Number(order.total()),
        SortKey::Name => SortValue::Text(order.customer_name().to_string()),
        SortKey::CreatedAt => SortValue::Time(order.created_at()),
        SortKey::UpdatedAt => SortValue::Time(order.updated_at()),
        SortKey::Id | SortKey::Quantity => SortValue::Int(order.id_typed().get()),
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    type Tx = InMemoryTx;

    async fn begin(&self, _deadline: &Deadline) -> StoreResult<InMemoryTx> {
        Ok(InMemoryTx::new(self.shared.clone()))
    }

    async fn inventory_item(&self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>> {
        Ok(self.shared.read()?.inventory.get(&id).cloned())
    }

    async fn inventory_page(&self, request: &PageRequest) -> StoreResult<Vec<InventoryItem>> {
        let rows: Vec<_> = self.shared.read()?.inventory.values().cloned().collect();
        Ok(paginate(rows, request, inventory_sort_value))
    }

    async fn inventory_count(&self) -> StoreResult<u64> {
        Ok(self.shared.read()?.inventory.len() as u64)
    }

    async fn stock_movements(&self, id: InventoryItemId) -> StoreResult<Vec<StockMovement>> {
        Ok(self
            .shared
            .read()?
            .movements
            .iter()
            .filter(|m| m.item_id == id)
            .cloned()
            .collect())
    }

    async fn menu_item(&self, id: MenuItemId) -> StoreResult<Option<MenuItem>> {
        Ok(self.shared.read()?.menu.get(&id).cloned())
    }

    async fn menu_items(&self, ids: &[MenuItemId]) -> StoreResult<Vec<MenuItem>> {
        let tables = self.shared.read()?;
        Ok(ids.iter().filter_map(|id| tables.menu.get(id).cloned()).collect())
    }

    async fn menu_page(&self, request: &PageRequest) -> StoreResult<Vec<MenuItem>> {
        let rows: Vec<_> = self.shared.read()?.menu.values().cloned().collect();
        Ok(paginate(rows, request, menu_sort_value))
    }

    async fn menu_count(&self) -> StoreResult<u64> {
        Ok(self.shared.read()?.menu.len() as u64)
    }

    async fn order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        Ok(self.shared.read()?.orders.get(&id).cloned())
    }

    async fn order_page(&self, request: &PageRequest) -> StoreResult<Vec<Order>> {
        let rows: Vec<_> = self.shared.read()?.orders.values().cloned().collect();
        Ok(paginate(rows, request, order_sort_value))
    }

    async fn order_count(&self) -> StoreResult<u64> {
        Ok(self.shared.read()?.orders.len() as u64)
    }

    async fn price_history(&self, id: MenuItemId) -> StoreResult<Vec<PriceChange>> {
        Ok(self
            .shared
            .read()?
            .price_changes
            .iter()
            .filter(|c| c.menu_item_id == id)
            .cloned()
            .collect())
    }

    async fn status_history(&self, id: OrderId) -> StoreResult<Vec<StatusChange>> {
        Ok(self
            .shared
            .read()?
            .status_changes
            .iter()
            .filter(|c| c.order_id == id)
            .cloned()
            .collect())
    }
}

/// In-memory unit of work.
///
/// Staged rows shadow committed ones; `None` marks a staged delete.
pub struct InMemoryTx {
    shared: Arc<Shared>,
    guards: RowGuards,
    inventory: BTreeMap<InventoryItemId, Option<InventoryItem>>,
    menu: BTreeMap<MenuItemId, Option<MenuItem>>,
    orders: BTreeMap<OrderId, Option<Order>>,
    movements: Vec<StockMovement>,
    price_changes: Vec<PriceChange>,
    status_changes: Vec<StatusChange>,
}

impl core::fmt::Debug for InMemoryTx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryTx")
            .field("locked_rows", &self.guards.len())
            .field("staged_inventory", &self.inventory.len())
            .field("staged_menu", &self.menu.len())
            .field("staged_orders", &self.orders.len())
            .finish()
    }
}

impl InMemoryTx {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            guards: RowGuards {
                shared: Arc::clone(&shared),
                held: HashMap::new(),
            },
            shared,
            inventory: BTreeMap::new(),
            menu: BTreeMap::new(),
            orders: BTreeMap::new(),
            movements: Vec::new(),
            price_changes: Vec::new(),
            status_changes: Vec::new(),
        }
    }

    /// Wait for and take the row lock for `key` (re-entrant within this unit of work).
    async fn lock_row(&mut self, key: RowKey) -> StoreResult<()> {
        if self.guards.contains(&key) {
            return Ok(());
        }
        let mutex = self.shared.row_lock(key)?;
        let guard = mutex.lock_owned().await;
        self.guards.held.insert(key, guard);
        Ok(())
    }

    fn ensure_locked(&self, key: RowKey) -> StoreResult<()> {
        if !self.guards.contains(&key) {
            return Err(StoreError::Backend(format!("{key:?} written without a row lock")));
        }
        Ok(())
    }

    fn current_inventory(&self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>> {
        if let Some(staged) = self.inventory.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.shared.read()?.inventory.get(&id).cloned())
    }

    fn current_menu(&self, id: MenuItemId) -> StoreResult<Option<MenuItem>> {
        if let Some(staged) = self.menu.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.shared.read()?.menu.get(&id).cloned())
    }

    fn current_order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        if let Some(staged) = self.orders.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.shared.read()?.orders.get(&id).cloned())
    }

    fn existing_inventory(&self, id: InventoryItemId) -> StoreResult<InventoryItem> {
        self.current_inventory(id)?
            .ok_or_else(|| StoreError::Backend(format!("inventory item {id} vanished while locked")))
    }

    fn references(&self, id: InventoryItemId) -> StoreResult<bool> {
        let uses = |menu: &MenuItem| menu.ingredients().iter().any(|i| i.inventory_item_id == id);

        if self.menu.values().flatten().any(uses) {
            return Ok(true);
        }
        let tables = self.shared.read()?;
        Ok(tables
            .menu
            .values()
            .filter(|menu| !self.menu.contains_key(&menu.id_typed()))
            .any(uses))
    }

    /// Apply every staged write to the committed tables at once.
    fn apply(self) -> StoreResult<()> {
        let InMemoryTx {
            shared,
            guards,
            inventory,
            menu,
            orders,
            movements,
            price_changes,
            status_changes,
        } = self;

        {
            let mut tables = shared.write()?;
            for (id, row) in inventory {
                match row {
                    Some(item) => tables.inventory.insert(id, item),
                    None => tables.inventory.remove(&id),
                };
            }
            tables.price_changes.extend(price_changes);
            for (id, row) in menu {
                match row {
                    Some(item) => {
                        tables.menu.insert(id, item);
                    }
                    None => {
                        tables.menu.remove(&id);
                        tables.price_changes.retain(|change| change.menu_item_id != id);
                    }
                }
            }
            for (id, row) in orders {
                match row {
                    Some(order) => tables.orders.insert(id, order),
                    None => tables.orders.remove(&id),
                };
            }
            tables.movements.extend(movements);
            tables.status_changes.extend(status_changes);
        }

        drop(guards);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryTx {
    #[instrument(level = "debug", skip(self), err)]
    async fn lock_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>> {
        self.lock_row(RowKey::Inventory(id)).await?;
        self.current_inventory(id)
    }

    async fn insert_inventory_item(
        &mut self,
        new: &NewInventoryItem,
        at: DateTime<Utc>,
    ) -> StoreResult<InventoryItem> {
        let id = InventoryItemId::new(next_id(&self.shared.inventory_seq));
        let item = InventoryItem::restore(
            id,
            new.name.clone(),
            new.quantity,
            new.unit.clone(),
            new.price,
            at,
            at,
        );
        self.inventory.insert(id, Some(item.clone()));
        Ok(item)
    }

    async fn update_inventory_item(&mut self, item: &InventoryItem) -> StoreResult<()> {
        let id = item.id_typed();
        self.ensure_locked(RowKey::Inventory(id))?;
        self.existing_inventory(id)?;
        if item.quantity() < Decimal::ZERO {
            return Err(StoreError::Constraint(format!(
                "inventory item {id} quantity cannot be negative"
            )));
        }
        self.inventory.insert(id, Some(item.clone()));
        Ok(())
    }

    async fn decrement_inventory(
        &mut self,
        id: InventoryItemId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.ensure_locked(RowKey::Inventory(id))?;
        let mut item = self.existing_inventory(id)?;
        item.consume(amount)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        item.touch(at);
        self.inventory.insert(id, Some(item));
        Ok(())
    }

    async fn inventory_item_referenced(&mut self, id: InventoryItemId) -> StoreResult<bool> {
        self.references(id)
    }

    async fn delete_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<()> {
        self.ensure_locked(RowKey::Inventory(id))?;
        if self.references(id)? {
            return Err(StoreError::Conflict(format!(
                "inventory item {id} is still referenced by a menu item"
            )));
        }
        self.inventory.insert(id, None);
        Ok(())
    }

    async fn record_stock_movement(&mut self, movement: &StockMovement) -> StoreResult<()> {
        self.movements.push(movement.clone());
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn lock_menu_item(&mut self, id: MenuItemId) -> StoreResult<Option<MenuItem>> {
        self.lock_row(RowKey::Menu(id)).await?;
        self.current_menu(id)
    }

    async fn insert_menu_item(&mut self, new: &NewMenuItem, at: DateTime<Utc>) -> StoreResult<MenuItem> {
        for ingredient in &new.ingredients {
            if self.current_inventory(ingredient.inventory_item_id)?.is_none() {
                return Err(StoreError::Conflict(format!(
                    "inventory item {} does not exist",
                    ingredient.inventory_item_id
                )));
            }
        }

        let id = MenuItemId::new(next_id(&self.shared.menu_seq));
        let item = MenuItem::restore(
            id,
            new.name.clone(),
            new.description.clone(),
            new.price,
            new.categories.clone(),
            new.allergens.clone(),
            new.metadata.clone(),
            new.ingredients.clone(),
            at,
            at,
        );
        self.menu.insert(id, Some(item.clone()));
        Ok(item)
    }

    async fn update_menu_item(&mut self, item: &MenuItem) -> StoreResult<()> {
        let id = item.id_typed();
        self.ensure_locked(RowKey::Menu(id))?;
        if self.current_menu(id)?.is_none() {
            return Err(StoreError::Backend(format!("menu item {id} vanished while locked")));
        }
        self.menu.insert(id, Some(item.clone()));
        Ok(())
    }

    async fn delete_menu_item(&mut self, id: MenuItemId) -> StoreResult<()> {
        self.ensure_locked(RowKey::Menu(id))?;
        self.menu.insert(id, None);
        Ok(())
    }

    async fn record_price_change(&mut self, change: &PriceChange) -> StoreResult<()> {
        self.price_changes.push(change.clone());
        Ok(())
    }

    async fn insert_order(&mut self, new: &NewOrder, at: DateTime<Utc>) -> StoreResult<Order> {
        let id = OrderId::new(next_id(&self.shared.order_seq));
        let order = Order::placed(id, new.clone(), at)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        self.orders.insert(id, Some(order.clone()));
        Ok(order)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn lock_order(&mut self, id: OrderId) -> StoreResult<Option<Order>> {
        self.lock_row(RowKey::Order(id)).await?;
        self.current_order(id)
    }

    async fn update_order(&mut self, order: &Order) -> StoreResult<()> {
        let id = order.id_typed();
        self.ensure_locked(RowKey::Order(id))?;
        if self.current_order(id)?.is_none() {
            return Err(StoreError::Backend(format!("order {id} vanished while locked")));
        }
        self.orders.insert(id, Some(order.clone()));
        Ok(())
    }

    async fn record_status_change(&mut self, change: &StatusChange) -> StoreResult<()> {
        self.status_changes.push(change.clone());
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.apply()
    }

    async fn rollback(self) -> StoreResult<()> {
        debug!(locked_rows = self.guards.len(), "discarding staged writes");
        Ok(())
    }
}
