use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::{Attributes, DomainError, DomainResult, Entity, Timestamped};
use brewline_inventory::InventoryItemId;

brewline_core::record_id!(MenuItemId, "MenuItemId");

/// One line of a bill-of-materials: how much of an ingredient a single unit
/// of the menu item consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuIngredient {
    pub inventory_item_id: InventoryItemId,
    pub quantity_per_unit: Decimal,
}

/// A sellable menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    id: MenuItemId,
    name: String,
    description: String,
    price: Decimal,
    categories: BTreeSet<String>,
    allergens: BTreeSet<String>,
    metadata: Attributes,
    ingredients: Vec<MenuIngredient>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MenuItem {
    /// Rebuild a menu item from persisted state.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: MenuItemId,
        name: String,
        description: String,
        price: Decimal,
        categories: BTreeSet<String>,
        allergens: BTreeSet<String>,
        metadata: Attributes,
        ingredients: Vec<MenuIngredient>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            description,
            price,
            categories,
            allergens,
            metadata,
            ingredients,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> MenuItemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    pub fn allergens(&self) -> &BTreeSet<String> {
        &self.allergens
    }

    pub fn metadata(&self) -> &Attributes {
        &self.metadata
    }

    pub fn ingredients(&self) -> &[MenuIngredient] {
        &self.ingredients
    }
}

impl Entity for MenuItem {
    const KIND: &'static str = "menu item";
    type Id = MenuItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Timestamped for MenuItem {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// Input for creating a menu item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMenuItem {
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub categories: BTreeSet<String>,
    pub allergens: BTreeSet<String>,
    pub metadata: Attributes,
    pub ingredients: Vec<MenuIngredient>,
}

impl NewMenuItem {
    pub fn validate(&self) -> DomainResult<()> {
        validate_name(&self.name)?;
        validate_price(self.price)?;

        let mut seen = HashSet::with_capacity(self.ingredients.len());
        for ingredient in &self.ingredients {
            if ingredient.quantity_per_unit <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "ingredient {} quantity must be positive",
                    ingredient.inventory_item_id
                )));
            }
            if !seen.insert(ingredient.inventory_item_id) {
                return Err(DomainError::validation(format!(
                    "ingredient {} listed more than once",
                    ingredient.inventory_item_id
                )));
            }
        }
        Ok(())
    }

    /// Referenced inventory ids in ascending order (the lock order).
    pub fn ingredient_ids(&self) -> Vec<InventoryItemId> {
        let ids: BTreeSet<_> = self
            .ingredients
            .iter()
            .map(|i| i.inventory_item_id)
            .collect();
        ids.into_iter().collect()
    }
}

/// Partial update for a menu item. The bill-of-materials is not patchable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItemPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub categories: Option<BTreeSet<String>>,
    pub allergens: Option<BTreeSet<String>>,
    pub metadata: Option<Attributes>,
}

impl MenuItemPatch {
    /// Apply every field that differs from the current value and report
    /// whether anything changed.
    pub fn apply(&self, item: &mut MenuItem) -> DomainResult<bool> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(price) = self.price {
            validate_price(price)?;
        }

        let mut changed = false;
        changed |= replace_if_different(&mut item.name, &self.name);
        changed |= replace_if_different(&mut item.description, &self.description);
        changed |= replace_if_different(&mut item.price, &self.price);
        changed |= replace_if_different(&mut item.categories, &self.categories);
        changed |= replace_if_different(&mut item.allergens, &self.allergens);
        changed |= replace_if_different(&mut item.metadata, &self.metadata);
        Ok(changed)
    }
}

fn replace_if_different<T: Clone + PartialEq>(slot: &mut T, value: &Option<T>) -> bool {
    match value {
        Some(v) if slot != v => {
            *slot = v.clone();
            true
        }
        _ => false,
    }
}

fn validate_name(name: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("name cannot be empty"));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> DomainResult<()> {
    if price < Decimal::ZERO {
        return Err(DomainError::validation("price cannot be negative"));
    }
    Ok(())
}
