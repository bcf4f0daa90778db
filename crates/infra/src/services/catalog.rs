//! Menu catalog.

use chrono::Utc;
use tracing::{info, instrument};

use brewline_core::{DomainError, Entity, Page, PageRequest, SortKey};
use brewline_inventory::InventoryItem;
use brewline_menu::{MenuItem, MenuItemId, MenuItemPatch, NewMenuItem, PriceChange};

use crate::deadline::Deadline;
use crate::error::{During, Operation, ServiceError};
use crate::locked::{abort, update_by_id};
use crate::store::{Storage, UnitOfWork};

pub const MENU_SORT_KEYS: &[SortKey] = &[
    SortKey::Id,
    SortKey::Name,
    SortKey::Price,
    SortKey::CreatedAt,
    SortKey::UpdatedAt,
];

#[derive(Debug, Clone)]
pub struct MenuCatalog<S> {
    storage: S,
}

impl<S> MenuCatalog<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

impl<S: Storage> MenuCatalog<S> {
    /// Create a menu item.
    ///
    /// Every ingredient row is locked, in ascending id order, for the length of
    /// the insert so a concurrent inventory delete cannot leave the new item
    /// pointing at nothing.
    #[instrument(skip(self, new, deadline), fields(name = %new.name, ingredients = new.ingredients.len()), err)]
    pub async fn create(&self, new: &NewMenuItem, deadline: &Deadline) -> Result<MenuItem, ServiceError> {
        let op = Operation::MenuCreate;
        new.validate().during(op)?;

        deadline
            .run(op, async {
                let mut tx = self.storage.begin(deadline).await.during(op)?;

                for ingredient_id in new.ingredient_ids() {
                    if tx.lock_inventory_item(ingredient_id).await.during(op)?.is_none() {
                        abort(tx, op).await;
                        return Err(ServiceError::new(
                            op,
                            DomainError::not_found(InventoryItem::KIND, ingredient_id),
                        ));
                    }
                }

                let item = tx.insert_menu_item(new, Utc::now()).await.during(op)?;
                tx.commit().await.during(op)?;

                info!(menu_item_id = %item.id_typed(), "menu item created");
                Ok(item)
            })
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self, request: &PageRequest) -> Result<Page<MenuItem>, ServiceError> {
        let op = Operation::MenuList;
        request.validate(MENU_SORT_KEYS).during(op)?;

        let total = self.storage.menu_count().await.during(op)?;
        let data = self.storage.menu_page(request).await.during(op)?;
        Ok(Page::new(request, total, data))
    }

    #[instrument(skip(self), fields(menu_item_id = %id), err)]
    pub async fn get(&self, id: MenuItemId) -> Result<MenuItem, ServiceError> {
        let op = Operation::MenuGet;
        self.storage
            .menu_item(id)
            .await
            .during(op)?
            .ok_or_else(|| ServiceError::new(op, DomainError::not_found(MenuItem::KIND, id)))
    }

    pub async fn total_count(&self) -> Result<u64, ServiceError> {
        self.storage.menu_count().await.during(Operation::MenuCount)
    }

    /// Price edits of one menu item, oldest first.
    #[instrument(skip(self), fields(menu_item_id = %id), err)]
    pub async fn price_history(&self, id: MenuItemId) -> Result<Vec<PriceChange>, ServiceError> {
        let op = Operation::MenuPriceHistory;
        if self.storage.menu_item(id).await.during(op)?.is_none() {
            return Err(ServiceError::new(op, DomainError::not_found(MenuItem::KIND, id)));
        }
        self.storage.price_history(id).await.during(op)
    }

    /// Apply a partial update. A price edit is recorded in the price history.
    /// The bill-of-materials is not patchable.
    #[instrument(skip(self, patch, deadline), fields(menu_item_id = %id), err)]
    pub async fn update(
        &self,
        id: MenuItemId,
        patch: &MenuItemPatch,
        deadline: &Deadline,
    ) -> Result<MenuItem, ServiceError> {
        update_by_id(
            &self.storage,
            Operation::MenuUpdate,
            id,
            deadline,
            |item: &mut MenuItem| patch.apply(item),
        )
        .await
    }

    /// Delete a menu item. Orders keep their line snapshots.
    #[instrument(skip(self, deadline), fields(menu_item_id = %id), err)]
    pub async fn delete(&self, id: MenuItemId, deadline: &Deadline) -> Result<(), ServiceError> {
        let op = Operation::MenuDelete;
        deadline
            .run(op, async {
                let mut tx = self.storage.begin(deadline).await.during(op)?;
                if tx.lock_menu_item(id).await.during(op)?.is_none() {
                    abort(tx, op).await;
                    return Err(ServiceError::new(op, DomainError::not_found(MenuItem::KIND, id)));
                }
                tx.delete_menu_item(id).await.during(op)?;
                tx.commit().await.during(op)?;

                info!(menu_item_id = %id, "menu item deleted");
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use brewline_core::Timestamped;
    use brewline_inventory::{InventoryItemId, NewInventoryItem};
    use brewline_menu::MenuIngredient;

    use crate::services::InventoryLedger;
    use crate::store::InMemoryStorage;

    fn test_deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    async fn test_ingredient(storage: &InMemoryStorage, name: &str) -> InventoryItemId {
        let ledger = InventoryLedger::new(storage.clone());
        let new = NewInventoryItem {
            name: name.to_string(),
            quantity: dec!(100),
            unit: "g".to_string(),
            price: dec!(0.10),
        };
        ledger.create(&new, &test_deadline()).await.unwrap().id_typed()
    }

    fn test_menu_item(ingredients: Vec<MenuIngredient>) -> NewMenuItem {
        NewMenuItem {
            name: "Flat white".to_string(),
            description: "Double shot, steamed milk".to_string(),
            price: dec!(3.80),
            categories: BTreeSet::from(["coffee".to_string()]),
            allergens: BTreeSet::from(["milk".to_string()]),
            ingredients,
            ..NewMenuItem::default()
        }
    }

    #[tokio::test]
    async fn create_keeps_bill_of_materials() {
        let storage = InMemoryStorage::new();
        let beans = test_ingredient(&storage, "Beans").await;
        let milk = test_ingredient(&storage, "Milk").await;
        let catalog = MenuCatalog::new(storage);

        let item = catalog
            .create(
                &test_menu_item(vec![
                    MenuIngredient { inventory_item_id: milk, quantity_per_unit: dec!(150) },
                    MenuIngredient { inventory_item_id: beans, quantity_per_unit: dec!(18) },
                ]),
                &test_deadline(),
            )
            .await
            .unwrap();

        let stored = catalog.get(item.id_typed()).await.unwrap();
        assert_eq!(stored.ingredients().len(), 2);
        assert!(stored.allergens().contains("milk"));
    }

    #[tokio::test]
    async fn unknown_ingredient_is_not_found() {
        let catalog = MenuCatalog::new(InMemoryStorage::new());
        let err = catalog
            .create(
                &test_menu_item(vec![MenuIngredient {
                    inventory_item_id: InventoryItemId::new(404),
                    quantity_per_unit: dec!(1),
                }]),
                &test_deadline(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "not_found");
        assert_eq!(catalog.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn price_update_bumps_timestamp() {
        let storage = InMemoryStorage::new();
        let beans = test_ingredient(&storage, "Beans").await;
        let catalog = MenuCatalog::new(storage);
        let item = catalog
            .create(
                &test_menu_item(vec![MenuIngredient {
                    inventory_item_id: beans,
                    quantity_per_unit: dec!(18),
                }]),
                &test_deadline(),
            )
            .await
            .unwrap();

        let patch = MenuItemPatch {
            price: Some(dec!(4.10)),
            ..MenuItemPatch::default()
        };
        let updated = catalog.update(item.id_typed(), &patch, &test_deadline()).await.unwrap();
        assert_eq!(updated.price(), dec!(4.10));
        assert!(updated.updated_at() >= item.updated_at());

        let err = catalog
            .update(item.id_typed(), &patch, &test_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn price_edits_are_recorded_once() {
        let catalog = MenuCatalog::new(InMemoryStorage::new());
        let item = catalog
            .create(
                &NewMenuItem {
                    price: dec!(5.00),
                    ..test_menu_item(Vec::new())
                },
                &test_deadline(),
            )
            .await
            .unwrap();
        let id = item.id_typed();
        assert!(catalog.price_history(id).await.unwrap().is_empty());

        let reprice = MenuItemPatch {
            price: Some(dec!(7.00)),
            ..MenuItemPatch::default()
        };
        let updated = catalog.update(id, &reprice, &test_deadline()).await.unwrap();

        let history = catalog.price_history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_price, dec!(5.00));
        assert_eq!(history[0].new_price, dec!(7.00));
        assert_eq!(history[0].changed_at, updated.updated_at());

        let same = MenuItemPatch {
            price: Some(dec!(7.0)),
            ..MenuItemPatch::default()
        };
        assert_eq!(
            catalog.update(id, &same, &test_deadline()).await.unwrap_err().code(),
            "conflict"
        );
        let rename = MenuItemPatch {
            name: Some("Cortado".to_string()),
            ..MenuItemPatch::default()
        };
        catalog.update(id, &rename, &test_deadline()).await.unwrap();
        assert_eq!(catalog.price_history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn price_history_of_unknown_item_is_not_found() {
        let catalog = MenuCatalog::new(InMemoryStorage::new());
        let err = catalog.price_history(MenuItemId::new(404)).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn negative_price_patch_is_rejected() {
        let catalog = MenuCatalog::new(InMemoryStorage::new());
        let item = catalog
            .create(&test_menu_item(Vec::new()), &test_deadline())
            .await
            .unwrap();

        let patch = MenuItemPatch {
            price: Some(Decimal::NEGATIVE_ONE),
            ..MenuItemPatch::default()
        };
        let err = catalog
            .update(item.id_typed(), &patch, &test_deadline())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let catalog = MenuCatalog::new(InMemoryStorage::new());
        let item = catalog
            .create(&test_menu_item(Vec::new()), &test_deadline())
            .await
            .unwrap();

        catalog.delete(item.id_typed(), &test_deadline()).await.unwrap();
        assert_eq!(catalog.get(item.id_typed()).await.unwrap_err().code(), "not_found");
        assert_eq!(
            catalog
                .delete(item.id_typed(), &test_deadline())
                .await
                .unwrap_err()
                .code(),
            "not_found"
        );
    }
}
