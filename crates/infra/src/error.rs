//! Errors returned by the application services.
//!
//! Every failure carries the [`Operation`] it happened in as a typed field and
//! an [`ErrorKind`] that separates deterministic domain failures from storage
//! failures. Callers branch on [`ServiceError::code`] or
//! [`ServiceError::is_retryable`], never on message text.

use thiserror::Error;

use brewline_core::DomainError;

use crate::store::StoreError;

/// The service operation a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InventoryCreate,
    InventoryList,
    InventoryGet,
    InventoryCount,
    InventoryUpdate,
    InventoryRestock,
    InventoryDelete,
    InventoryHistory,
    MenuCreate,
    MenuList,
    MenuGet,
    MenuCount,
    MenuUpdate,
    MenuDelete,
    MenuPriceHistory,
    OrderCreate,
    OrderGet,
    OrderList,
    OrderAdvance,
    OrderClose,
    OrderCancel,
    OrderHistory,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::InventoryCreate => "inventory.create",
            Operation::InventoryList => "inventory.list",
            Operation::InventoryGet => "inventory.get",
            Operation::InventoryCount => "inventory.count",
            Operation::InventoryUpdate => "inventory.update",
            Operation::InventoryRestock => "inventory.restock",
            Operation::InventoryDelete => "inventory.delete",
            Operation::InventoryHistory => "inventory.history",
            Operation::MenuCreate => "menu.create",
            Operation::MenuList => "menu.list",
            Operation::MenuGet => "menu.get",
            Operation::MenuCount => "menu.count",
            Operation::MenuUpdate => "menu.update",
            Operation::MenuDelete => "menu.delete",
            Operation::MenuPriceHistory => "menu.price_history",
            Operation::OrderCreate => "order.create",
            Operation::OrderGet => "order.get",
            Operation::OrderList => "order.list",
            Operation::OrderAdvance => "order.advance",
            Operation::OrderClose => "order.close",
            Operation::OrderCancel => "order.cancel",
            Operation::OrderHistory => "order.history",
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Lock wait timeout, deadlock, serialization failure, deadline expiry or
    /// lost connection. Safe to retry.
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for ErrorKind {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => ErrorKind::TransientStorage(msg),
            StoreError::Conflict(msg) => ErrorKind::Domain(DomainError::Conflict(msg)),
            StoreError::Constraint(msg) => ErrorKind::Domain(DomainError::InvariantViolation(msg)),
            StoreError::Backend(msg) => ErrorKind::Storage(msg),
        }
    }
}

/// Error returned by every service operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{operation}: {kind}")]
pub struct ServiceError {
    pub operation: Operation,
    pub kind: ErrorKind,
}

impl ServiceError {
    pub fn new(operation: Operation, kind: impl Into<ErrorKind>) -> Self {
        Self {
            operation,
            kind: kind.into(),
        }
    }

    pub fn deadline_exceeded(operation: Operation) -> Self {
        Self::new(
            operation,
            ErrorKind::TransientStorage("deadline exceeded".to_string()),
        )
    }

    /// Stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            ErrorKind::Domain(err) => err.code(),
            ErrorKind::TransientStorage(_) => "transient_storage_error",
            ErrorKind::Storage(_) => "storage_error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::TransientStorage(_))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match &self.kind {
            ErrorKind::Domain(err) => Some(err),
            _ => None,
        }
    }
}

/// Attach an operation to a lower-layer result.
pub(crate) trait During<T> {
    fn during(self, operation: Operation) -> Result<T, ServiceError>;
}

impl<T> During<T> for Result<T, StoreError> {
    fn during(self, operation: Operation) -> Result<T, ServiceError> {
        self.map_err(|e| ServiceError::new(operation, e))
    }
}

impl<T> During<T> for Result<T, DomainError> {
    fn during(self, operation: Operation) -> Result<T, ServiceError> {
        self.map_err(|e| ServiceError::new(operation, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_prefixed_by_operation() {
        let err = ServiceError::new(Operation::OrderCreate, DomainError::validation("empty"));
        assert_eq!(err.to_string(), "order.create: validation failed: empty");
        assert_eq!(err.code(), "validation_error");
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = ServiceError::new(Operation::InventoryUpdate, StoreError::Transient("x".into()));
        assert!(transient.is_retryable());
        assert_eq!(transient.code(), "transient_storage_error");

        let backend = ServiceError::new(Operation::InventoryUpdate, StoreError::Backend("x".into()));
        assert!(!backend.is_retryable());
        assert_eq!(backend.code(), "storage_error");
    }

    #[test]
    fn store_conflicts_surface_as_domain_conflicts() {
        let err = ServiceError::new(Operation::MenuCreate, StoreError::Conflict("fk".into()));
        assert_eq!(err.code(), "conflict");

        let err = ServiceError::new(Operation::OrderCreate, StoreError::Constraint("check".into()));
        assert_eq!(err.code(), "invariant_violation");
    }

    #[test]
    fn deadline_is_transient() {
        let err = ServiceError::deadline_exceeded(Operation::OrderCreate);
        assert!(err.is_retryable());
        assert_eq!(err.operation, Operation::OrderCreate);
    }
}
