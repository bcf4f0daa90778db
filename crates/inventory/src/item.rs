use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::{DomainError, DomainResult, Entity, Timestamped};

brewline_core::record_id!(InventoryItemId, "InventoryItemId");

/// A stocked ingredient.
///
/// `quantity` is the quantity-on-hand and never drops below zero. Only the
/// storage layer constructs items (via [`InventoryItem::restore`]); every
/// change afterwards goes through the methods below so the invariant is
/// checked in one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    id: InventoryItemId,
    name: String,
    quantity: Decimal,
    unit: String,
    price: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InventoryItem {
    /// Rebuild an item from persisted state.
    pub fn restore(
        id: InventoryItemId,
        name: String,
        quantity: Decimal,
        unit: String,
        price: Decimal,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            quantity,
            unit,
            price,
            created_at,
            updated_at,
        }
    }

    pub fn id_typed(&self) -> InventoryItemId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    /// Fail with `InsufficientStock` unless `required` is on hand.
    pub fn ensure_available(&self, required: Decimal) -> DomainResult<()> {
        if self.quantity < required {
            return Err(DomainError::insufficient_stock(
                self.id,
                self.quantity,
                required,
            ));
        }
        Ok(())
    }

    /// Remove `amount` from stock.
    pub fn consume(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("consumed amount must be positive"));
        }
        self.ensure_available(amount)?;
        self.quantity -= amount;
        Ok(())
    }

    /// Add `amount` to stock.
    pub fn restock(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("restock amount must be positive"));
        }
        self.quantity = self.quantity.checked_add(amount).ok_or_else(|| {
            DomainError::validation(format!(
                "restocking inventory item {} exceeds the representable range",
                self.id
            ))
        })?;
        Ok(())
    }

    fn set_quantity(&mut self, quantity: Decimal) -> DomainResult<()> {
        validate_quantity(quantity)?;
        self.quantity = quantity;
        Ok(())
    }
}

impl Entity for InventoryItem {
    const KIND: &'static str = "inventory item";
    type Id = InventoryItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Timestamped for InventoryItem {
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

/// Input for creating an inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInventoryItem {
    pub name: String,
    pub quantity: Decimal,
    pub unit: String,
    pub price: Decimal,
}

impl NewInventoryItem {
    pub fn validate(&self) -> DomainResult<()> {
        validate_name(&self.name)?;
        validate_quantity(self.quantity)?;
        validate_unit(&self.unit)?;
        validate_price(self.price)
    }
}

/// Partial update for an inventory item. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryPatch {
    pub name: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit: Option<String>,
    pub price: Option<Decimal>,
}

impl InventoryPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.quantity.is_none() && self.unit.is_none() && self.price.is_none()
    }

    /// Apply every field that differs from the current value.
    ///
    /// Returns whether anything changed. Values are validated before any field
    /// is written, so a rejected patch leaves the item as it was.
    pub fn apply(&self, item: &mut InventoryItem) -> DomainResult<bool> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(quantity) = self.quantity {
            validate_quantity(quantity)?;
        }
        if let Some(unit) = &self.unit {
            validate_unit(unit)?;
        }
        if let Some(price) = self.price {
            validate_price(price)?;
        }

        let mut changed = false;

        if let Some(name) = &self.name {
            if item.name != *name {
                item.name = name.clone();
                changed = true;
            }
        }

        if let Some(quantity) = self.quantity {
            if item.quantity != quantity {
                item.set_quantity(quantity)?;
                changed = true;
            }
        }

        if let Some(unit) = &self.unit {
            if item.unit != *unit {
                item.unit = unit.clone();
                changed = true;
            }
        }

        if let Some(price) = self.price {
            if item.price != price {
                item.price = price;
                changed = true;
            }
        }

        Ok(changed)
    }
}

fn validate_name(name: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("name cannot be empty"));
    }
    Ok(())
}

fn validate_unit(unit: &str) -> DomainResult<()> {
    if unit.trim().is_empty() {
        return Err(DomainError::validation("unit cannot be empty"));
    }
    Ok(())
}

fn validate_quantity(quantity: Decimal) -> DomainResult<()> {
    if quantity < Decimal::ZERO {
        return Err(DomainError::validation("quantity cannot be negative"));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> DomainResult<()> {
    if price < Decimal::ZERO {
        return Err(DomainError::validation("price cannot be negative"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn milk(quantity: Decimal) -> InventoryItem {
        let at = Utc::now();
        InventoryItem::restore(
            InventoryItemId::new(1),
            "Milk".to_string(),
            quantity,
            "l".to_string(),
            dec!(1.20),
            at,
            at,
        )
    }

    #[test]
    fn ensure_available_reports_shortfall() {
        let item = milk(dec!(4));
        assert!(item.ensure_available(dec!(4)).is_ok());

        match item.ensure_available(dec!(6)).unwrap_err() {
            DomainError::InsufficientStock {
                ingredient_id,
                available,
                required,
            } => {
                assert_eq!(ingredient_id, 1);
                assert_eq!(available, dec!(4));
                assert_eq!(required, dec!(6));
            }
            other => panic!("Expected InsufficientStock, got {other:?}"),
        }
    }

    #[test]
    fn consume_never_goes_negative() {
        let mut item = milk(dec!(10));
        item.consume(dec!(6)).unwrap();
        assert_eq!(item.quantity(), dec!(4));

        assert!(item.consume(dec!(6)).is_err());
        assert_eq!(item.quantity(), dec!(4));
    }

    #[test]
    fn consume_and_restock_reject_non_positive_amounts() {
        let mut item = milk(dec!(1));
        assert!(matches!(item.consume(dec!(0)), Err(DomainError::Validation(_))));
        assert!(matches!(item.restock(dec!(-1)), Err(DomainError::Validation(_))));
    }

    #[test]
    fn restock_overflow_keeps_quantity() {
        let mut item = milk(Decimal::MAX);
        assert!(matches!(item.restock(dec!(1)), Err(DomainError::Validation(_))));
        assert_eq!(item.quantity(), Decimal::MAX);
    }

    #[test]
    fn new_item_validation() {
        let mut new = NewInventoryItem {
            name: "Beans".to_string(),
            quantity: dec!(2.5),
            unit: "kg".to_string(),
            price: dec!(18),
        };
        assert!(new.validate().is_ok());

        new.quantity = dec!(-0.1);
        assert!(new.validate().is_err());

        new.quantity = dec!(1);
        new.name = "  ".to_string();
        assert!(new.validate().is_err());
    }

    #[test]
    fn patch_reports_no_change_when_values_match() {
        let mut item = milk(dec!(3));
        let patch = InventoryPatch {
            name: Some("Milk".to_string()),
            quantity: Some(dec!(3)),
            ..Default::default()
        };
        assert!(!patch.apply(&mut item).unwrap());
    }

    #[test]
    fn patch_applies_only_differing_fields() {
        let mut item = milk(dec!(3));
        let patch = InventoryPatch {
            name: Some("Oat milk".to_string()),
            unit: Some("l".to_string()),
            ..Default::default()
        };
        assert!(patch.apply(&mut item).unwrap());
        assert_eq!(item.name(), "Oat milk");
        assert_eq!(item.unit(), "l");
        assert_eq!(item.quantity(), dec!(3));
    }

    #[test]
    fn rejected_patch_leaves_item_untouched() {
        let mut item = milk(dec!(3));
        let before = item.clone();
        let patch = InventoryPatch {
            name: Some("Whole milk".to_string()),
            quantity: Some(dec!(-1)),
            ..Default::default()
        };
        assert!(patch.apply(&mut item).is_err());
        assert_eq!(item, before);
    }

    proptest! {
        #[test]
        fn consume_keeps_quantity_non_negative(
            start in 0u32..1_000,
            takes in proptest::collection::vec(1u32..200, 0..20),
        ) {
            let mut item = milk(Decimal::from(start));
            for take in takes {
                let _ = item.consume(Decimal::from(take));
                prop_assert!(item.quantity() >= Decimal::ZERO);
            }
        }
    }
}
