//! Inventory domain module.
//!
//! This crate contains business rules for stocked ingredients, implemented
//! purely as deterministic domain logic (no IO, no storage).

pub mod item;
pub mod movement;

pub use item::{InventoryItem, InventoryItemId, InventoryPatch, NewInventoryItem};
pub use movement::{MovementKind, StockMovement};
