//! Postgres storage backend.
//!
//! Every unit of work is a database transaction. Row locks are taken with
//! `SELECT ... FOR UPDATE` and held until commit or rollback; an uncommitted
//! transaction is rolled back when dropped. Each transaction sets
//! `lock_timeout` and `statement_timeout` from the remaining deadline so a
//! blocked lock wait fails instead of outliving the request.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001` | `Transient` | Serialization failure |
//! | Database | `40P01` | `Transient` | Deadlock detected |
//! | Database | `55P03` | `Transient` | Lock wait hit `lock_timeout` |
//! | Database | `57014` | `Transient` | Statement hit `statement_timeout` |
//! | Database | `23505` | `Conflict` | Unique violation |
//! | Database | `23503` | `Conflict` | Foreign key violation (e.g. referenced ingredient) |
//! | Database | `23514` | `Constraint` | Check violation (e.g. negative stock) |
//! | Database | Any other | `Backend` | Other database errors |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Transient` | Pool or connection trouble |
//! | Other | N/A | `Backend` | Decode failures, protocol errors, etc. |

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};

use brewline_core::{Attributes, PageRequest, SortKey, Timestamped};
use brewline_inventory::{InventoryItem, InventoryItemId, MovementKind, NewInventoryItem, StockMovement};
use brewline_menu::{MenuIngredient, MenuItem, MenuItemId, NewMenuItem, PriceChange};
use brewline_orders::{NewOrder, Order, OrderId, OrderItem, OrderStatus, PaymentMethod, StatusChange};

use super::r#trait::{Storage, StoreError, StoreResult, UnitOfWork};
use crate::config::Config;
use crate::deadline::Deadline;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const INVENTORY_COLUMNS: &str = "id, name, quantity, unit, price, created_at, updated_at";
const MENU_COLUMNS: &str =
    "id, name, description, price, categories, allergens, metadata, created_at, updated_at";
const ORDER_COLUMNS: &str = "id, customer_name, total_amount, status, payment_method, \
                             special_instructions, created_at, updated_at";

/// Postgres-backed storage.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    /// Create a new PostgresStorage with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool sized and bounded by `config`.
    pub async fn connect(config: &Config) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.request_deadline)
            .connect(&config.database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        info!("schema up to date");
        Ok(())
    }

    async fn acquire(&self) -> StoreResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    #[instrument(skip(self, deadline), fields(remaining_ms), err)]
    async fn begin(&self, deadline: &Deadline) -> StoreResult<PostgresTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // A zero timeout disables the limit in Postgres, so never go below 1ms.
        let remaining_ms = deadline.remaining().as_millis().max(1);
        Span::current().record("remaining_ms", remaining_ms as u64);
        let timeout = format!("{remaining_ms}ms");

        sqlx::query(
            "SELECT set_config('lock_timeout', $1, true), set_config('statement_timeout', $1, true)",
        )
        .bind(&timeout)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_timeouts", e))?;

        Ok(PostgresTx { tx })
    }

    async fn inventory_item(&self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>> {
        let mut conn = self.acquire().await?;
        fetch_inventory(&mut conn, id, false).await
    }

    #[instrument(skip(self), err)]
    async fn inventory_page(&self, request: &PageRequest) -> StoreResult<Vec<InventoryItem>> {
        let sql = format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory ORDER BY {} ASC, id ASC LIMIT $1 OFFSET $2",
            inventory_sort_column(request.sort_key())
        );
        let rows = sqlx::query(&sql)
            .bind(page_limit(request)?)
            .bind(page_offset(request)?)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("inventory_page", e))?;

        rows.iter().map(decode_inventory).collect()
    }

    async fn inventory_count(&self) -> StoreResult<u64> {
        count(&self.pool, "SELECT COUNT(*) AS total FROM inventory").await
    }

    async fn stock_movements(&self, id: InventoryItemId) -> StoreResult<Vec<StockMovement>> {
        let rows = sqlx::query(
            r#"
            SELECT inventory_id, change_type, quantity_change, order_id, created_at
            FROM inventory_transactions
            WHERE inventory_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock_movements", e))?;

        rows.iter()
            .map(|row| -> StoreResult<StockMovement> {
                MovementRow::from_row(row)
                    .map_err(|e| decode_error("inventory_transactions", e))?
                    .try_into()
            })
            .collect()
    }

    async fn menu_item(&self, id: MenuItemId) -> StoreResult<Option<MenuItem>> {
        let mut conn = self.acquire().await?;
        fetch_menu(&mut conn, id, false).await
    }

    async fn menu_items(&self, ids: &[MenuItemId]) -> StoreResult<Vec<MenuItem>> {
        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {MENU_COLUMNS} FROM menu_items WHERE id = ANY($1) ORDER BY id ASC"
        ))
        .bind(&raw)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("menu_items", e))?;

        with_ingredients(&mut conn, rows).await
    }

    #[instrument(skip(self), err)]
    async fn menu_page(&self, request: &PageRequest) -> StoreResult<Vec<MenuItem>> {
        let sql = format!(
            "SELECT {MENU_COLUMNS} FROM menu_items ORDER BY {} ASC, id ASC LIMIT $1 OFFSET $2",
            menu_sort_column(request.sort_key())
        );
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(page_limit(request)?)
            .bind(page_offset(request)?)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("menu_page", e))?;

        with_ingredients(&mut conn, rows).await
    }

    async fn menu_count(&self) -> StoreResult<u64> {
        count(&self.pool, "SELECT COUNT(*) AS total FROM menu_items").await
    }

    async fn price_history(&self, id: MenuItemId) -> StoreResult<Vec<PriceChange>> {
        let rows = sqlx::query(
            r#"
            SELECT menu_item_id, old_price, new_price, created_at
            FROM price_history
            WHERE menu_item_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("price_history", e))?;

        rows.iter()
            .map(|row| {
                PriceRow::from_row(row)
                    .map(PriceChange::from)
                    .map_err(|e| decode_error("price_history", e))
            })
            .collect()
    }

    async fn order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        let mut conn = self.acquire().await?;
        fetch_order(&mut conn, id, false).await
    }

    #[instrument(skip(self), err)]
    async fn order_page(&self, request: &PageRequest) -> StoreResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY {} ASC, id ASC LIMIT $1 OFFSET $2",
            order_sort_column(request.sort_key())
        );
        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(page_limit(request)?)
            .bind(page_offset(request)?)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("order_page", e))?;

        with_order_items(&mut conn, rows).await
    }

    async fn order_count(&self) -> StoreResult<u64> {
        count(&self.pool, "SELECT COUNT(*) AS total FROM orders").await
    }

    async fn status_history(&self, id: OrderId) -> StoreResult<Vec<StatusChange>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, previous_status, new_status, changed_at
            FROM order_status_history
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status_history", e))?;

        rows.iter()
            .map(|row| -> StoreResult<StatusChange> {
                StatusRow::from_row(row)
                    .map_err(|e| decode_error("order_status_history", e))?
                    .try_into()
            })
            .collect()
    }
}

/// Postgres unit of work: one open transaction.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresTx {
    #[instrument(level = "debug", skip(self), err)]
    async fn lock_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<Option<InventoryItem>> {
        fetch_inventory(&mut self.tx, id, true).await
    }

    async fn insert_inventory_item(
        &mut self,
        new: &NewInventoryItem,
        at: DateTime<Utc>,
    ) -> StoreResult<InventoryItem> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO inventory (name, quantity, unit, price, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {INVENTORY_COLUMNS}
            "#
        ))
        .bind(&new.name)
        .bind(new.quantity)
        .bind(&new.unit)
        .bind(new.price)
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_inventory_item", e))?;

        decode_inventory(&row)
    }

    async fn update_inventory_item(&mut self, item: &InventoryItem) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE inventory
            SET name = $2, quantity = $3, unit = $4, price = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(item.id_typed().get())
        .bind(item.name())
        .bind(item.quantity())
        .bind(item.unit())
        .bind(item.price())
        .bind(item.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_inventory_item", e))?;

        expect_one_row("inventory item", item.id_typed().get(), result.rows_affected())
    }

    async fn decrement_inventory(
        &mut self,
        id: InventoryItemId,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE inventory SET quantity = quantity - $2, updated_at = $3 WHERE id = $1",
        )
        .bind(id.get())
        .bind(amount)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("decrement_inventory", e))?;

        expect_one_row("inventory item", id.get(), result.rows_affected())
    }

    async fn inventory_item_referenced(&mut self, id: InventoryItemId) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM menu_item_ingredients WHERE ingredient_id = $1) AS referenced",
        )
        .bind(id.get())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("inventory_item_referenced", e))?;

        row.try_get("referenced")
            .map_err(|e| decode_error("menu_item_ingredients", e))
    }

    async fn delete_inventory_item(&mut self, id: InventoryItemId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM inventory WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_inventory_item", e))?;

        expect_one_row("inventory item", id.get(), result.rows_affected())
    }

    async fn record_stock_movement(&mut self, movement: &StockMovement) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_transactions (inventory_id, change_type, quantity_change, order_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(movement.item_id.get())
        .bind(movement.kind.as_str())
        .bind(movement.delta)
        .bind(movement.order_id)
        .bind(movement.recorded_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_stock_movement", e))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn lock_menu_item(&mut self, id: MenuItemId) -> StoreResult<Option<MenuItem>> {
        fetch_menu(&mut self.tx, id, true).await
    }

    async fn insert_menu_item(&mut self, new: &NewMenuItem, at: DateTime<Utc>) -> StoreResult<MenuItem> {
        let row = sqlx::query(
            r#"
            INSERT INTO menu_items (name, description, price, categories, allergens, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING id
            "#,
        )
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.price)
        .bind(new.categories.iter().cloned().collect::<Vec<_>>())
        .bind(new.allergens.iter().cloned().collect::<Vec<_>>())
        .bind(Json(&new.metadata))
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_menu_item", e))?;

        let id: i64 = row.try_get("id").map_err(|e| decode_error("menu_items", e))?;

        for (position, ingredient) in new.ingredients.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO menu_item_ingredients (menu_item_id, ingredient_id, quantity_used, position)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(ingredient.inventory_item_id.get())
            .bind(ingredient.quantity_per_unit)
            .bind(position as i32)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_menu_item_ingredient", e))?;
        }

        Ok(MenuItem::restore(
            MenuItemId::new(id),
            new.name.clone(),
            new.description.clone(),
            new.price,
            new.categories.clone(),
            new.allergens.clone(),
            new.metadata.clone(),
            new.ingredients.clone(),
            at,
            at,
        ))
    }

    async fn update_menu_item(&mut self, item: &MenuItem) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE menu_items
            SET name = $2, description = $3, price = $4, categories = $5, allergens = $6,
                metadata = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(item.id_typed().get())
        .bind(item.name())
        .bind(item.description())
        .bind(item.price())
        .bind(item.categories().iter().cloned().collect::<Vec<_>>())
        .bind(item.allergens().iter().cloned().collect::<Vec<_>>())
        .bind(Json(item.metadata()))
        .bind(item.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_menu_item", e))?;

        expect_one_row("menu item", item.id_typed().get(), result.rows_affected())
    }

    async fn delete_menu_item(&mut self, id: MenuItemId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM menu_items WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_menu_item", e))?;

        expect_one_row("menu item", id.get(), result.rows_affected())
    }

    #[instrument(level = "debug", skip(self, new), fields(lines = new.items.len()), err)]
    async fn insert_order(&mut self, new: &NewOrder, at: DateTime<Utc>) -> StoreResult<Order> {
        let total = new.total().map_err(|e| StoreError::Constraint(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO orders (customer_name, total_amount, status, payment_method, special_instructions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id
            "#,
        )
        .bind(&new.customer_name)
        .bind(total)
        .bind(OrderStatus::Pending.as_str())
        .bind(new.payment_method.as_str())
        .bind(Json(&new.special_instructions))
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        let id: i64 = row.try_get("id").map_err(|e| decode_error("orders", e))?;

        for (line_no, item) in new.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, line_no, menu_item_id, name, unit_price, quantity)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(id)
            .bind(line_no as i32 + 1)
            .bind(item.menu_item_id.get())
            .bind(&item.name)
            .bind(item.unit_price)
            .bind(i64::from(item.quantity))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }

        Order::placed(OrderId::new(id), new.clone(), at)
            .map_err(|e| StoreError::Constraint(e.to_string()))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn lock_order(&mut self, id: OrderId) -> StoreResult<Option<Order>> {
        fetch_order(&mut self.tx, id, true).await
    }

    async fn update_order(&mut self, order: &Order) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET customer_name = $2, total_amount = $3, status = $4, payment_method = $5,
                special_instructions = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(order.id_typed().get())
        .bind(order.customer_name())
        .bind(order.total())
        .bind(order.status().as_str())
        .bind(order.payment_method().as_str())
        .bind(Json(order.special_instructions()))
        .bind(order.updated_at())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        expect_one_row("order", order.id_typed().get(), result.rows_affected())
    }

    async fn record_price_change(&mut self, change: &PriceChange) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO price_history (menu_item_id, old_price, new_price, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(change.menu_item_id.get())
        .bind(change.old_price)
        .bind(change.new_price)
        .bind(change.changed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_price_change", e))?;
        Ok(())
    }

    async fn record_status_change(&mut self, change: &StatusChange) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO order_status_history (order_id, previous_status, new_status, changed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(change.order_id.get())
        .bind(change.previous.as_str())
        .bind(change.next.as_str())
        .bind(change.changed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_status_change", e))?;
        Ok(())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn inventory_sort_column(key: SortKey) -> &'static str {
    match key {
        SortKey::Name => "name",
        SortKey::Quantity => "quantity",
        SortKey::Price => "price",
        SortKey::CreatedAt => "created_at",
        SortKey::UpdatedAt => "updated_at",
        SortKey::Id | SortKey::Total => "id",
    }
}

fn menu_sort_column(key: SortKey) -> &'static str {
    match key {
        SortKey::Name => "name",
        SortKey::Price => "price",
        SortKey::CreatedAt => "created_at",
        SortKey::UpdatedAt => "updated_at",
        SortKey::Id | SortKey::Quantity | SortKey::Total => "id",
    }
}

fn order_sort_column(key: SortKey) -> &'static str {
    match key {
        SortKey::Total => "total_amount",
        SortKey::CreatedAt => "created_at",
        SortKey::UpdatedAt => "updated_at",
        SortKey::Id | SortKey::Name | SortKey::Price | SortKey::Quantity => "id",
    }
}

fn page_limit(request: &PageRequest) -> StoreResult<i64> {
    i64::try_from(request.limit()).map_err(|_| StoreError::Backend("page limit out of range".into()))
}

fn page_offset(request: &PageRequest) -> StoreResult<i64> {
    i64::try_from(request.offset()).map_err(|_| StoreError::Backend("page offset out of range".into()))
}

async fn count(pool: &PgPool, sql: &str) -> StoreResult<u64> {
    let row = sqlx::query(sql)
        .fetch_one(pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;
    let total: i64 = row.try_get("total").map_err(|e| decode_error("count", e))?;
    Ok(total.max(0) as u64)
}

fn expect_one_row(entity: &str, id: i64, affected: u64) -> StoreResult<()> {
    if affected != 1 {
        return Err(StoreError::Backend(format!(
            "{entity} {id}: expected one row to change, {affected} did"
        )));
    }
    Ok(())
}

fn locking(for_update: bool) -> &'static str {
    if for_update { " FOR UPDATE" } else { "" }
}

async fn fetch_inventory(
    conn: &mut PgConnection,
    id: InventoryItemId,
    for_update: bool,
) -> StoreResult<Option<InventoryItem>> {
    let row = sqlx::query(&format!(
        "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE id = $1{}",
        locking(for_update)
    ))
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_inventory", e))?;

    row.as_ref().map(decode_inventory).transpose()
}

async fn fetch_menu(
    conn: &mut PgConnection,
    id: MenuItemId,
    for_update: bool,
) -> StoreResult<Option<MenuItem>> {
    let row = sqlx::query(&format!(
        "SELECT {MENU_COLUMNS} FROM menu_items WHERE id = $1{}",
        locking(for_update)
    ))
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_menu", e))?;

    match row {
        Some(row) => Ok(with_ingredients(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

async fn fetch_order(
    conn: &mut PgConnection,
    id: OrderId,
    for_update: bool,
) -> StoreResult<Option<Order>> {
    let row = sqlx::query(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}",
        locking(for_update)
    ))
    .bind(id.get())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_order", e))?;

    match row {
        Some(row) => Ok(with_order_items(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

/// Decode menu rows and attach their bills-of-materials, keeping row order.
async fn with_ingredients(conn: &mut PgConnection, rows: Vec<PgRow>) -> StoreResult<Vec<MenuItem>> {
    let heads = rows
        .iter()
        .map(|row| MenuRow::from_row(row).map_err(|e| decode_error("menu_items", e)))
        .collect::<StoreResult<Vec<_>>>()?;
    let ids: Vec<i64> = heads.iter().map(|h| h.id).collect();

    let lines = sqlx::query(
        r#"
        SELECT menu_item_id, ingredient_id, quantity_used
        FROM menu_item_ingredients
        WHERE menu_item_id = ANY($1)
        ORDER BY menu_item_id ASC, position ASC
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("menu_item_ingredients", e))?;

    let mut by_menu: HashMap<i64, Vec<MenuIngredient>> = HashMap::new();
    for line in &lines {
        let menu_item_id: i64 = line
            .try_get("menu_item_id")
            .map_err(|e| decode_error("menu_item_ingredients", e))?;
        let ingredient_id: i64 = line
            .try_get("ingredient_id")
            .map_err(|e| decode_error("menu_item_ingredients", e))?;
        let quantity_used: Decimal = line
            .try_get("quantity_used")
            .map_err(|e| decode_error("menu_item_ingredients", e))?;
        by_menu.entry(menu_item_id).or_default().push(MenuIngredient {
            inventory_item_id: InventoryItemId::new(ingredient_id),
            quantity_per_unit: quantity_used,
        });
    }

    Ok(heads
        .into_iter()
        .map(|head| {
            let ingredients = by_menu.remove(&head.id).unwrap_or_default();
            head.into_menu_item(ingredients)
        })
        .collect())
}

/// Decode order rows and attach their lines, keeping row order.
async fn with_order_items(conn: &mut PgConnection, rows: Vec<PgRow>) -> StoreResult<Vec<Order>> {
    let heads = rows
        .iter()
        .map(|row| OrderRow::from_row(row).map_err(|e| decode_error("orders", e)))
        .collect::<StoreResult<Vec<_>>>()?;
    let ids: Vec<i64> = heads.iter().map(|h| h.id).collect();

    let lines = sqlx::query(
        r#"
        SELECT order_id, menu_item_id, name, unit_price, quantity
        FROM order_items
        WHERE order_id = ANY($1)
        ORDER BY order_id ASC, line_no ASC
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("order_items", e))?;

    let mut by_order: HashMap<i64, Vec<OrderItem>> = HashMap::new();
    for line in &lines {
        let line = OrderItemRow::from_row(line).map_err(|e| decode_error("order_items", e))?;
        let quantity = u32::try_from(line.quantity)
            .map_err(|_| StoreError::Backend(format!("order {} has an out of range quantity", line.order_id)))?;
        by_order.entry(line.order_id).or_default().push(OrderItem {
            menu_item_id: MenuItemId::new(line.menu_item_id),
            name: line.name,
            unit_price: line.unit_price,
            quantity,
        });
    }

    heads
        .into_iter()
        .map(|head| {
            let items = by_order.remove(&head.id).unwrap_or_default();
            head.into_order(items)
        })
        .collect()
}

fn decode_inventory(row: &PgRow) -> StoreResult<InventoryItem> {
    InventoryRow::from_row(row)
        .map(InventoryItem::from)
        .map_err(|e| decode_error("inventory", e))
}

fn decode_error(table: &str, err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("failed to decode {table} row: {err}"))
}

fn corrupt(table: &str, err: impl core::fmt::Display) -> StoreError {
    StoreError::Backend(format!("corrupt {table} row: {err}"))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // serialization failure, deadlock, lock timeout, statement timeout
                Some("40001" | "40P01" | "55P03" | "57014") => StoreError::Transient(msg),
                Some("23505" | "23503") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Transient(format!("tls error in {operation}: {e}")),
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct InventoryRow {
    id: i64,
    name: String,
    quantity: Decimal,
    unit: String,
    price: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InventoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InventoryRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            quantity: row.try_get("quantity")?,
            unit: row.try_get("unit")?,
            price: row.try_get("price")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<InventoryRow> for InventoryItem {
    fn from(row: InventoryRow) -> Self {
        InventoryItem::restore(
            InventoryItemId::new(row.id),
            row.name,
            row.quantity,
            row.unit,
            row.price,
            row.created_at,
            row.updated_at,
        )
    }
}

#[derive(Debug)]
struct MenuRow {
    id: i64,
    name: String,
    description: String,
    price: Decimal,
    categories: Vec<String>,
    allergens: Vec<String>,
    metadata: Attributes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MenuRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let metadata: Json<Attributes> = row.try_get("metadata")?;
        Ok(MenuRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            categories: row.try_get("categories")?,
            allergens: row.try_get("allergens")?,
            metadata: metadata.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl MenuRow {
    fn into_menu_item(self, ingredients: Vec<MenuIngredient>) -> MenuItem {
        MenuItem::restore(
            MenuItemId::new(self.id),
            self.name,
            self.description,
            self.price,
            self.categories.into_iter().collect::<BTreeSet<_>>(),
            self.allergens.into_iter().collect::<BTreeSet<_>>(),
            self.metadata,
            ingredients,
            self.created_at,
            self.updated_at,
        )
    }
}

#[derive(Debug)]
struct OrderRow {
    id: i64,
    customer_name: String,
    total_amount: Decimal,
    status: String,
    payment_method: String,
    special_instructions: Attributes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let special_instructions: Json<Attributes> = row.try_get("special_instructions")?;
        Ok(OrderRow {
            id: row.try_get("id")?,
            customer_name: row.try_get("customer_name")?,
            total_amount: row.try_get("total_amount")?,
            status: row.try_get("status")?,
            payment_method: row.try_get("payment_method")?,
            special_instructions: special_instructions.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> StoreResult<Order> {
        let status: OrderStatus = self.status.parse().map_err(|e| corrupt("orders", e))?;
        let payment_method: PaymentMethod =
            self.payment_method.parse().map_err(|e| corrupt("orders", e))?;

        let order = Order::restore(
            OrderId::new(self.id),
            self.customer_name,
            status,
            payment_method,
            self.special_instructions,
            items,
            self.created_at,
            self.updated_at,
        )
        .map_err(|e| StoreError::Constraint(e.to_string()))?;
        order
            .ensure_consistent_total(self.total_amount)
            .map_err(|e| StoreError::Constraint(e.to_string()))?;
        Ok(order)
    }
}

#[derive(Debug)]
struct OrderItemRow {
    order_id: i64,
    menu_item_id: i64,
    name: String,
    unit_price: Decimal,
    quantity: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OrderItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderItemRow {
            order_id: row.try_get("order_id")?,
            menu_item_id: row.try_get("menu_item_id")?,
            name: row.try_get("name")?,
            unit_price: row.try_get("unit_price")?,
            quantity: row.try_get("quantity")?,
        })
    }
}

#[derive(Debug)]
struct MovementRow {
    inventory_id: i64,
    change_type: String,
    quantity_change: Decimal,
    order_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MovementRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MovementRow {
            inventory_id: row.try_get("inventory_id")?,
            change_type: row.try_get("change_type")?,
            quantity_change: row.try_get("quantity_change")?,
            order_id: row.try_get("order_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = StoreError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let kind: MovementKind = row
            .change_type
            .parse()
            .map_err(|e| corrupt("inventory_transactions", e))?;
        Ok(StockMovement {
            item_id: InventoryItemId::new(row.inventory_id),
            kind,
            delta: row.quantity_change,
            order_id: row.order_id,
            recorded_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct StatusRow {
    order_id: i64,
    previous_status: String,
    new_status: String,
    changed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StatusRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StatusRow {
            order_id: row.try_get("order_id")?,
            previous_status: row.try_get("previous_status")?,
            new_status: row.try_get("new_status")?,
            changed_at: row.try_get("changed_at")?,
        })
    }
}

impl TryFrom<StatusRow> for StatusChange {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(StatusChange {
            order_id: OrderId::new(row.order_id),
            previous: row
                .previous_status
                .parse()
                .map_err(|e| corrupt("order_status_history", e))?,
            next: row
                .new_status
                .parse()
                .map_err(|e| corrupt("order_status_history", e))?,
            changed_at: row.changed_at,
        })
    }
}

#[derive(Debug)]
struct PriceRow {
    menu_item_id: i64,
    old_price: Decimal,
    new_price: Decimal,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PriceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PriceRow {
            menu_item_id: row.try_get("menu_item_id")?,
            old_price: row.try_get("old_price")?,
            new_price: row.try_get("new_price")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<PriceRow> for PriceChange {
    fn from(row: PriceRow) -> Self {
        PriceChange {
            menu_item_id: MenuItemId::new(row.menu_item_id),
            old_price: row.old_price,
            new_price: row.new_price,
            changed_at: row.created_at,
        }
    }
}
