//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// stock shortfalls, lifecycle rules, conflicts). Infrastructure concerns
/// belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The aggregated requirement for an ingredient exceeds what is on hand.
    #[error(
        "insufficient stock for inventory item {ingredient_id}: available {available}, required {required}"
    )]
    InsufficientStock {
        ingredient_id: i64,
        available: Decimal,
        required: Decimal,
    },

    /// An order status change that the lifecycle does not allow.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// A conflict occurred (no-op patch, referenced record, duplicate key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<i64>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn insufficient_stock(
        ingredient_id: impl Into<i64>,
        available: Decimal,
        required: Decimal,
    ) -> Self {
        Self::InsufficientStock {
            ingredient_id: ingredient_id.into(),
            available,
            required,
        }
    }

    pub fn invalid_transition(from: &'static str, to: &'static str) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Returned by the locked mutation protocol when a patch changes nothing.
    pub fn no_fields_updated() -> Self {
        Self::Conflict("no fields updated".to_string())
    }

    /// Stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::NotFound { .. } => "not_found",
            DomainError::InsufficientStock { .. } => "insufficient_stock",
            DomainError::InvalidTransition { .. } => "invalid_transition",
            DomainError::Conflict(_) => "conflict",
            DomainError::InvariantViolation(_) => "invariant_violation",
        }
    }
}
