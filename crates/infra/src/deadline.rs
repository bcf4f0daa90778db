//! Per-request deadlines.
//!
//! A [`Deadline`] bounds everything a service call does, including waiting for
//! row locks. When it expires the in-flight future is dropped, which drops the
//! open unit of work and rolls it back.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{Operation, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn at(expires_at: Instant) -> Self {
        Self { expires_at }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Run `fut` to completion or fail with a retryable error at the deadline.
    pub async fn run<T, F>(&self, operation: Operation, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout_at(self.expires_at, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%operation, "deadline exceeded; transaction abandoned");
                Err(ServiceError::deadline_exceeded(operation))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let out = deadline
            .run(Operation::InventoryGet, async { Ok::<_, ServiceError>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(!deadline.is_expired());
    }

    #[tokio::test]
    async fn expiry_is_retryable() {
        let deadline = Deadline::after(Duration::from_millis(10));
        let err = deadline
            .run(Operation::InventoryUpdate, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.operation, Operation::InventoryUpdate);
        assert!(deadline.is_expired());
    }
}
