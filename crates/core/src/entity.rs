//! Entity traits: identity + continuity across state changes.

use chrono::{DateTime, Utc};

/// Entity marker + minimal interface.
pub trait Entity {
    /// Human-readable record kind, used in errors and log fields.
    const KIND: &'static str;

    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug + Send + Sync + Into<i64>;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// Entities carrying server-managed creation/modification timestamps.
pub trait Timestamped {
    fn created_at(&self) -> DateTime<Utc>;

    fn updated_at(&self) -> DateTime<Utc>;

    /// Record a committed modification at `at`.
    fn touch(&mut self, at: DateTime<Utc>);
}
