//! Menu domain module.
//!
//! Menu items, their bill-of-materials, the rules for creating and patching
//! them and the record of price edits. Pure domain logic.

pub mod item;
pub mod price;

pub use item::{MenuIngredient, MenuItem, MenuItemId, MenuItemPatch, NewMenuItem};
pub use price::PriceChange;
