//! Cross-crate scenarios for the services running on a shared store.
//!
//! Tests: Request → Service → UnitOfWork → Storage
//!
//! Verifies:
//! - Stock never goes negative and concurrent orders cannot oversell
//! - Failed orders leave every table untouched
//! - Concurrent updates of one row are serialized, none are lost
//! - Arithmetic overflow is a validation error, never a panic
//! - Deadlines turn lock waits into retryable errors
//!
//! Postgres variants are `#[ignore]`d and read `DATABASE_URL`.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use brewline_core::{Page, PageRequest, SortKey, Timestamped};
    use brewline_inventory::{
        InventoryItem, InventoryItemId, InventoryPatch, MovementKind, NewInventoryItem,
    };
    use brewline_menu::{MenuIngredient, MenuItemId, MenuItemPatch, NewMenuItem};
    use brewline_orders::{OrderLineRequest, OrderStatus, OrderView, PlaceOrder};

    use crate::config::Config;
    use crate::deadline::Deadline;
    use crate::error::Operation;
    use crate::services::Services;
    use crate::store::{InMemoryStorage, PostgresStorage, Storage, UnitOfWork};

    fn test_deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn test_services() -> (Services<InMemoryStorage>, InMemoryStorage) {
        let storage = InMemoryStorage::new();
        (Services::new(storage.clone()), storage)
    }

    async fn test_ingredient<S: Storage>(
        services: &Services<S>,
        name: &str,
        quantity: Decimal,
    ) -> InventoryItemId {
        services
            .inventory
            .create(
                &NewInventoryItem {
                    name: name.to_string(),
                    quantity,
                    unit: "g".to_string(),
                    price: dec!(0.01),
                },
                &test_deadline(),
            )
            .await
            .unwrap()
            .id_typed()
    }

    async fn test_menu_item<S: Storage>(
        services: &Services<S>,
        name: &str,
        price: Decimal,
        ingredients: &[(InventoryItemId, Decimal)],
    ) -> MenuItemId {
        services
            .menu
            .create(
                &NewMenuItem {
                    name: name.to_string(),
                    price,
                    ingredients: ingredients
                        .iter()
                        .map(|&(inventory_item_id, quantity_per_unit)| MenuIngredient {
                            inventory_item_id,
                            quantity_per_unit,
                        })
                        .collect(),
                    ..NewMenuItem::default()
                },
                &test_deadline(),
            )
            .await
            .unwrap()
            .id_typed()
    }

    fn test_order(lines: &[(MenuItemId, i64)]) -> PlaceOrder {
        PlaceOrder {
            customer_name: "Grace".to_string(),
            payment_method: "cash".to_string(),
            lines: lines
                .iter()
                .map(|&(menu_item_id, quantity)| OrderLineRequest { menu_item_id, quantity })
                .collect(),
            ..PlaceOrder::default()
        }
    }

    async fn quantity_of(storage: &impl Storage, id: InventoryItemId) -> Decimal {
        storage.inventory_item(id).await.unwrap().unwrap().quantity()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_cannot_oversell() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        let doppio = test_menu_item(&services, "Doppio", dec!(3.00), &[(beans, dec!(6))]).await;

        let request = test_order(&[(doppio, 1)]);
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = services.orders.clone();
                let request = request.clone();
                tokio::spawn(async move { engine.create_order(&request, &test_deadline()).await })
            })
            .collect();

        let mut placed = 0;
        let mut refused = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => placed += 1,
                Err(err) => refused.push(err),
            }
        }

        assert_eq!(placed, 1);
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].code(), "insufficient_stock");
        assert_eq!(quantity_of(&storage, beans).await, dec!(4));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_order_leaves_everything_untouched() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let milk = test_ingredient(&services, "Milk", dec!(50)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;
        let latte = test_menu_item(
            &services,
            "Latte",
            dec!(4.50),
            &[(beans, dec!(18)), (milk, dec!(200))],
        )
        .await;

        let err = services
            .orders
            .create_order(&test_order(&[(espresso, 2), (latte, 1)]), &test_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "insufficient_stock");

        assert_eq!(quantity_of(&storage, beans).await, dec!(100));
        assert_eq!(quantity_of(&storage, milk).await, dec!(50));
        assert_eq!(services.orders.list(&PageRequest::default()).await.unwrap().total_items, 0);
        let movements = services.inventory.history(beans).await.unwrap();
        assert!(movements.iter().all(|m| m.kind != MovementKind::Usage));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_menu_item_writes_nothing() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;

        let err = services
            .orders
            .create_order(
                &test_order(&[(espresso, 1), (MenuItemId::new(9_999), 1)]),
                &test_deadline(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "not_found");
        assert_eq!(err.operation, Operation::OrderCreate);
        assert_eq!(quantity_of(&storage, beans).await, dec!(100));
        assert_eq!(storage.order_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shared_ingredient_is_aggregated_across_lines() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(50)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;
        let ristretto = test_menu_item(&services, "Ristretto", dec!(2.80), &[(beans, dec!(15))]).await;

        // 18 + 2 * 15 = 48 of 50
        let order = services
            .orders
            .create_order(&test_order(&[(espresso, 1), (ristretto, 2)]), &test_deadline())
            .await
            .unwrap();

        assert_eq!(order.total(), dec!(8.10));
        assert_eq!(quantity_of(&storage, beans).await, dec!(2));

        let usage: Vec<_> = services
            .inventory
            .history(beans)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MovementKind::Usage)
            .collect();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].delta, dec!(-48));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_restocks_are_not_lost() {
        let (services, storage) = test_services();
        let cups = test_ingredient(&services, "Cups", dec!(0)).await;

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let ledger = services.inventory.clone();
                tokio::spawn(async move { ledger.restock(cups, dec!(1), &test_deadline()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(quantity_of(&storage, cups).await, dec!(20));
        assert_eq!(services.inventory.history(cups).await.unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_patches_both_apply() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;

        let rename = {
            let ledger = services.inventory.clone();
            tokio::spawn(async move {
                let patch = InventoryPatch {
                    name: Some("House beans".to_string()),
                    ..InventoryPatch::default()
                };
                ledger.update(beans, &patch, &test_deadline()).await
            })
        };
        let reprice = {
            let ledger = services.inventory.clone();
            tokio::spawn(async move {
                let patch = InventoryPatch {
                    price: Some(dec!(0.02)),
                    ..InventoryPatch::default()
                };
                ledger.update(beans, &patch, &test_deadline()).await
            })
        };
        rename.await.unwrap().unwrap();
        reprice.await.unwrap().unwrap();

        let item = storage.inventory_item(beans).await.unwrap().unwrap();
        assert_eq!(item.name(), "House beans");
        assert_eq!(item.price(), dec!(0.02));
        assert_eq!(item.quantity(), dec!(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflowing_order_total_is_rejected_without_writes() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let gold = test_menu_item(&services, "Gold latte", Decimal::MAX, &[(beans, dec!(1))]).await;

        let err = services
            .orders
            .create_order(&test_order(&[(gold, 2)]), &test_deadline())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "validation_error");
        assert_eq!(quantity_of(&storage, beans).await, dec!(100));
        assert_eq!(
            services.orders.list(&PageRequest::new(1, 10, None)).await.unwrap().total_items,
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflowing_restock_is_rejected() {
        let (services, storage) = test_services();
        let silo = test_ingredient(&services, "Silo", Decimal::MAX).await;
        let before = storage.inventory_item(silo).await.unwrap().unwrap();

        let err = services
            .inventory
            .restock(silo, dec!(1), &test_deadline())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "validation_error");
        let after = storage.inventory_item(silo).await.unwrap().unwrap();
        assert_eq!(after.quantity(), Decimal::MAX);
        assert_eq!(after.updated_at(), before.updated_at());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn noop_patch_is_a_conflict_and_keeps_timestamp() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        let before = storage.inventory_item(beans).await.unwrap().unwrap();

        let patch = InventoryPatch {
            name: Some("Beans".to_string()),
            quantity: Some(dec!(10.000)),
            ..InventoryPatch::default()
        };
        let err = services
            .inventory
            .update(beans, &patch, &test_deadline())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "conflict");
        let after = storage.inventory_item(beans).await.unwrap().unwrap();
        assert_eq!(after.updated_at(), before.updated_at());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn orders_keep_their_price_snapshot() {
        let (services, _) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(5.00), &[(beans, dec!(18))]).await;

        let order = services
            .orders
            .create_order(&test_order(&[(espresso, 1)]), &test_deadline())
            .await
            .unwrap();

        services
            .menu
            .update(
                espresso,
                &MenuItemPatch {
                    price: Some(dec!(7.00)),
                    ..MenuItemPatch::default()
                },
                &test_deadline(),
            )
            .await
            .unwrap();

        let stored = services.orders.get(order.id_typed()).await.unwrap();
        let view = OrderView::try_from(&stored).unwrap();
        assert_eq!(view.total, dec!(5.00));
        assert_eq!(view.items[0].unit_price, dec!(5.00));
        assert_eq!(view.status, "pending");

        let prices = services.menu.price_history(espresso).await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!((prices[0].old_price, prices[0].new_price), (dec!(5.00), dec!(7.00)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pagination_round_trip() {
        let (services, _) = test_services();
        for n in 0..25 {
            test_ingredient(&services, &format!("Item {n:02}"), Decimal::from(n)).await;
        }

        let page = |n| PageRequest::new(n, 10, Some(SortKey::Quantity));
        let first: Page<InventoryItem> = services.inventory.list(&page(1)).await.unwrap();
        assert_eq!(first.total_items, 25);
        assert_eq!(first.total_pages, 3);
        assert!(first.has_next_page);
        assert_eq!(first.data[0].quantity(), dec!(0));

        let last = services.inventory.list(&page(3)).await.unwrap();
        assert_eq!(last.data.len(), 5);
        assert!(!last.has_next_page);
        assert_eq!(last.data[4].quantity(), dec!(24));

        let beyond = services.inventory.list(&page(4)).await.unwrap();
        assert!(beyond.data.is_empty());
        assert!(!beyond.has_next_page);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn referenced_ingredient_cannot_be_deleted() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;

        let err = services
            .inventory
            .delete(beans, &test_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(storage.inventory_item(beans).await.unwrap().is_some());

        services.menu.delete(espresso, &test_deadline()).await.unwrap();
        services.inventory.delete(beans, &test_deadline()).await.unwrap();
        assert!(storage.inventory_item(beans).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lock_wait_past_deadline_is_retryable() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;

        let mut holder = storage.begin(&test_deadline()).await.unwrap();
        holder.lock_inventory_item(beans).await.unwrap();

        let short = Deadline::after(Duration::from_millis(50));
        let err = services
            .inventory
            .restock(beans, dec!(5), &short)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.operation, Operation::InventoryRestock);

        holder.rollback().await.unwrap();
        let item = services
            .inventory
            .restock(beans, dec!(5), &test_deadline())
            .await
            .unwrap();
        assert_eq!(item.quantity(), dec!(15));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_orders_do_not_wait_on_each_other() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let tea = test_ingredient(&services, "Tea", dec!(100)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;
        let chai = test_menu_item(&services, "Chai", dec!(3.20), &[(tea, dec!(5))]).await;

        let mut holder = storage.begin(&test_deadline()).await.unwrap();
        holder.lock_inventory_item(tea).await.unwrap();

        services
            .orders
            .create_order(&test_order(&[(espresso, 1)]), &Deadline::after(Duration::from_millis(500)))
            .await
            .unwrap();

        let err = services
            .orders
            .create_order(&test_order(&[(chai, 1)]), &Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        holder.rollback().await.unwrap();
        assert_eq!(quantity_of(&storage, tea).await, dec!(100));
        assert_eq!(quantity_of(&storage, beans).await, dec!(82));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_changes_are_recorded_in_order() {
        let (services, storage) = test_services();
        let beans = test_ingredient(&services, "Beans", dec!(100)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;
        let order = services
            .orders
            .create_order(&test_order(&[(espresso, 1)]), &test_deadline())
            .await
            .unwrap();
        let id = order.id_typed();

        let processing = services
            .orders
            .advance(id, OrderStatus::Processing, &test_deadline())
            .await
            .unwrap();
        assert!(processing.updated_at() >= order.updated_at());

        let cancelled = services.orders.cancel(id, &test_deadline()).await.unwrap();
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert!(services.orders.close(id, &test_deadline()).await.is_err());

        let history = storage.status_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].previous, OrderStatus::Processing);
        assert_eq!(history[1].next, OrderStatus::Cancelled);

        // Cancelling does not put consumed stock back.
        assert_eq!(quantity_of(&storage, beans).await, dec!(82));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn stock_never_goes_negative(
            on_hand in 0u32..200,
            per_unit in 1u32..30,
            quantities in prop::collection::vec(1i64..6, 1..12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (services, storage) = test_services();
                let beans = test_ingredient(&services, "Beans", Decimal::from(on_hand)).await;
                let shot = test_menu_item(
                    &services,
                    "Shot",
                    dec!(1.00),
                    &[(beans, Decimal::from(per_unit))],
                )
                .await;

                let mut expected = Decimal::from(on_hand);
                for quantity in quantities {
                    let needed = Decimal::from(per_unit) * Decimal::from(quantity);
                    let result = services
                        .orders
                        .create_order(&test_order(&[(shot, quantity)]), &test_deadline())
                        .await;
                    match result {
                        Ok(_) => expected -= needed,
                        Err(err) => assert_eq!(err.code(), "insufficient_stock"),
                    }
                    let now = quantity_of(&storage, beans).await;
                    assert!(now >= Decimal::ZERO);
                    assert_eq!(now, expected);
                }
            });
        }
    }

    async fn postgres_services() -> (Services<PostgresStorage>, PostgresStorage) {
        let config = Config::from_env().unwrap();
        let storage = PostgresStorage::connect(&config).await.unwrap();
        storage.migrate().await.unwrap();
        (Services::new(storage.clone()), storage)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn postgres_concurrent_orders_cannot_oversell() {
        let (services, storage) = postgres_services().await;
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        let doppio = test_menu_item(&services, "Doppio", dec!(3.00), &[(beans, dec!(6))]).await;

        let request = test_order(&[(doppio, 1)]);
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = services.orders.clone();
                let request = request.clone();
                tokio::spawn(async move { engine.create_order(&request, &test_deadline()).await })
            })
            .collect();

        let mut placed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                placed += 1;
            }
        }
        assert_eq!(placed, 1);
        assert_eq!(quantity_of(&storage, beans).await, dec!(4));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn postgres_price_edit_is_recorded() {
        let (services, _) = postgres_services().await;
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        let espresso = test_menu_item(&services, "Espresso", dec!(5.00), &[(beans, dec!(18))]).await;

        let patch = MenuItemPatch {
            price: Some(dec!(7.00)),
            ..MenuItemPatch::default()
        };
        services.menu.update(espresso, &patch, &test_deadline()).await.unwrap();

        let prices = services.menu.price_history(espresso).await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].new_price, dec!(7.00));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn postgres_referenced_ingredient_cannot_be_deleted() {
        let (services, _) = postgres_services().await;
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;
        test_menu_item(&services, "Espresso", dec!(2.50), &[(beans, dec!(18))]).await;

        let err = services
            .inventory
            .delete(beans, &test_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn postgres_lock_wait_past_deadline_is_retryable() {
        let (services, storage) = postgres_services().await;
        let beans = test_ingredient(&services, "Beans", dec!(10)).await;

        let mut holder = storage.begin(&test_deadline()).await.unwrap();
        holder.lock_inventory_item(beans).await.unwrap();

        let err = services
            .inventory
            .restock(beans, dec!(1), &Deadline::after(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        holder.rollback().await.unwrap();
    }
}
