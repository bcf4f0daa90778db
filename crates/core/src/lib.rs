//! `brewline-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod attributes;
pub mod entity;
pub mod error;
pub mod id;
pub mod pagination;

pub use attributes::Attributes;
pub use entity::{Entity, Timestamped};
pub use error::{DomainError, DomainResult};
pub use pagination::{Page, PageRequest, SortKey};
