//! Application services.
//!
//! Each service is generic over a [`crate::store::Storage`] backend and takes a
//! [`crate::Deadline`] on every call that touches storage.

pub mod catalog;
pub mod fulfillment;
pub mod ledger;

pub use catalog::MenuCatalog;
pub use fulfillment::OrderFulfillment;
pub use ledger::InventoryLedger;

/// All services wired to one storage backend.
#[derive(Debug, Clone)]
pub struct Services<S> {
    pub inventory: InventoryLedger<S>,
    pub menu: MenuCatalog<S>,
    pub orders: OrderFulfillment<S>,
}

impl<S: Clone> Services<S> {
    pub fn new(storage: S) -> Self {
        Self {
            inventory: InventoryLedger::new(storage.clone()),
            menu: MenuCatalog::new(storage.clone()),
            orders: OrderFulfillment::new(storage),
        }
    }
}
