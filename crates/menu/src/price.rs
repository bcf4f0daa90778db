//! Price history of menu items.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use brewline_core::Timestamped;

use crate::item::{MenuItem, MenuItemId};

/// One recorded price edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub menu_item_id: MenuItemId,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub changed_at: DateTime<Utc>,
}

impl PriceChange {
    /// The price edit between two versions of one item, stamped with the
    /// newer version's `updated_at`. `None` when the price is numerically
    /// unchanged.
    pub fn between(before: &MenuItem, after: &MenuItem) -> Option<Self> {
        if before.price() == after.price() {
            return None;
        }
        Some(Self {
            menu_item_id: after.id_typed(),
            old_price: before.price(),
            new_price: after.price(),
            changed_at: after.updated_at(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::MenuItemPatch;
    use brewline_core::Attributes;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn espresso(price: Decimal) -> MenuItem {
        let at = Utc::now();
        MenuItem::restore(
            MenuItemId::new(3),
            "Espresso".to_string(),
            String::new(),
            price,
            BTreeSet::new(),
            BTreeSet::new(),
            Attributes::new(),
            Vec::new(),
            at,
            at,
        )
    }

    #[test]
    fn price_edit_is_recorded() {
        let before = espresso(dec!(5.00));
        let mut after = before.clone();
        let patch = MenuItemPatch {
            price: Some(dec!(7.00)),
            ..MenuItemPatch::default()
        };
        assert!(patch.apply(&mut after).unwrap());

        let change = PriceChange::between(&before, &after).unwrap();
        assert_eq!(change.menu_item_id, MenuItemId::new(3));
        assert_eq!(change.old_price, dec!(5.00));
        assert_eq!(change.new_price, dec!(7.00));
    }

    #[test]
    fn rescaled_price_is_not_a_change() {
        assert!(PriceChange::between(&espresso(dec!(5.00)), &espresso(dec!(5.0))).is_none());
    }
}
