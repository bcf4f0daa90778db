//! Infrastructure layer: storage backends, configuration, deadlines and the
//! application services built on them.

pub mod config;
pub mod deadline;
pub mod error;
pub mod locked;
pub mod services;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{Config, ConfigError};
pub use deadline::Deadline;
pub use error::{ErrorKind, Operation, ServiceError};
pub use locked::{Lockable, update_by_id};
pub use services::{InventoryLedger, MenuCatalog, OrderFulfillment, Services};
pub use store::{InMemoryStorage, PostgresStorage, Storage, StoreError, UnitOfWork};
