//! Order placement: request validation, price snapshots and the aggregated
//! ingredient consumption an order implies.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::{Attributes, DomainError, DomainResult};
use brewline_inventory::InventoryItemId;
use brewline_menu::{MenuItem, MenuItemId};

use crate::order::{OrderItem, sum_line_totals};
use crate::status::PaymentMethod;

/// One requested line, as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub menu_item_id: MenuItemId,
    pub quantity: i64,
}

/// An order placement request, as received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub customer_name: String,
    pub payment_method: String,
    pub special_instructions: Attributes,
    pub lines: Vec<OrderLineRequest>,
}

impl PlaceOrder {
    pub fn validate(&self) -> DomainResult<ValidatedOrder> {
        if self.customer_name.trim().is_empty() {
            return Err(DomainError::validation("customer name cannot be empty"));
        }
        let payment_method: PaymentMethod = self.payment_method.parse()?;
        if self.lines.is_empty() {
            return Err(DomainError::validation("order must contain at least one item"));
        }

        let mut lines = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            if line.quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "quantity for menu item {} must be positive",
                    line.menu_item_id
                )));
            }
            let quantity = u32::try_from(line.quantity).map_err(|_| {
                DomainError::validation(format!(
                    "quantity for menu item {} is too large",
                    line.menu_item_id
                ))
            })?;
            lines.push(ValidatedLine {
                menu_item_id: line.menu_item_id,
                quantity,
            });
        }

        Ok(ValidatedOrder {
            customer_name: self.customer_name.clone(),
            payment_method,
            special_instructions: self.special_instructions.clone(),
            lines,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedLine {
    pub menu_item_id: MenuItemId,
    pub quantity: u32,
}

/// A placement request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedOrder {
    pub customer_name: String,
    pub payment_method: PaymentMethod,
    pub special_instructions: Attributes,
    pub lines: Vec<ValidatedLine>,
}

impl ValidatedOrder {
    /// Distinct menu item ids, ascending.
    pub fn menu_item_ids(&self) -> Vec<MenuItemId> {
        let mut ids: Vec<_> = self.lines.iter().map(|l| l.menu_item_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Snapshot names and prices from `menus` and aggregate the consumption.
    ///
    /// Every line's menu item must be present in `menus`.
    pub fn price(
        self,
        menus: &BTreeMap<MenuItemId, MenuItem>,
    ) -> DomainResult<(NewOrder, Consumption)> {
        let mut items = Vec::with_capacity(self.lines.len());
        let mut consumption = Consumption::default();

        for line in &self.lines {
            let menu = menus
                .get(&line.menu_item_id)
                .ok_or_else(|| DomainError::not_found("menu item", line.menu_item_id))?;

            consumption.add(menu, line.quantity)?;
            items.push(OrderItem {
                menu_item_id: line.menu_item_id,
                name: menu.name().to_string(),
                unit_price: menu.price(),
                quantity: line.quantity,
            });
        }
        sum_line_totals(&items)?;

        let order = NewOrder {
            customer_name: self.customer_name,
            payment_method: self.payment_method,
            special_instructions: self.special_instructions,
            items,
        };
        Ok((order, consumption))
    }
}

/// Priced order ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_name: String,
    pub payment_method: PaymentMethod,
    pub special_instructions: Attributes,
    pub items: Vec<OrderItem>,
}

impl NewOrder {
    pub fn total(&self) -> DomainResult<Decimal> {
        sum_line_totals(&self.items)
    }
}

/// Total quantity of each ingredient an order needs, keyed (and therefore
/// iterated, and locked) in ascending ingredient id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Consumption(BTreeMap<InventoryItemId, Decimal>);

impl Consumption {
    /// Add `quantity` units of `menu` to the requirement.
    ///
    /// On overflow the requirement is left as it was.
    pub fn add(&mut self, menu: &MenuItem, quantity: u32) -> DomainResult<()> {
        let units = Decimal::from(quantity);
        let mut next = self.0.clone();
        for ingredient in menu.ingredients() {
            let required = next
                .entry(ingredient.inventory_item_id)
                .or_insert(Decimal::ZERO);
            let current = *required;
            *required = ingredient
                .quantity_per_unit
                .checked_mul(units)
                .and_then(|amount| current.checked_add(amount))
                .ok_or_else(|| {
                    DomainError::validation(format!(
                        "consumption of inventory item {} exceeds the representable range",
                        ingredient.inventory_item_id
                    ))
                })?;
        }
        self.0 = next;
        Ok(())
    }

    pub fn get(&self, id: InventoryItemId) -> Option<Decimal> {
        self.0.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InventoryItemId, Decimal)> + '_ {
        self.0.iter().map(|(id, qty)| (*id, *qty))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
