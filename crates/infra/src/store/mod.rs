//! Storage boundary.
//!
//! Services talk to storage through two traits: [`Storage`] for non-locking
//! reads and for opening transactions, and [`UnitOfWork`] for everything that
//! happens inside one. Two backends implement them: an in-memory store for
//! tests and development, and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryStorage, InMemoryTx};
pub use postgres::{PostgresStorage, PostgresTx};
pub use r#trait::{Storage, StoreError, StoreResult, UnitOfWork};
