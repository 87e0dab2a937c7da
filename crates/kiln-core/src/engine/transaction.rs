//! Transaction boundary abstraction.
//!
//! The chunk engine demarcates every chunk with begin/commit/rollback, and
//! batchlet invocations are wrapped once. The runtime does not integrate a
//! transaction manager itself; the environment injects whatever boundary its
//! resources need. `LocalTransactionBoundary` is the default for resources
//! with no transactional behavior.

use thiserror::Error;

/// Errors crossing the transaction boundary.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction begin failed: {0}")]
    Begin(String),

    #[error("transaction commit failed: {0}")]
    Commit(String),

    #[error("transaction rollback failed: {0}")]
    Rollback(String),
}

/// Begin/commit/rollback primitives, global or local, injected by the
/// environment.
pub trait TransactionBoundary: Send + Sync {
    fn begin(&self) -> Result<(), TransactionError>;
    fn commit(&self) -> Result<(), TransactionError>;
    fn rollback(&self) -> Result<(), TransactionError>;
}

/// No-op boundary for non-transactional resources.
#[derive(Debug, Default)]
pub struct LocalTransactionBoundary;

impl TransactionBoundary for LocalTransactionBoundary {
    fn begin(&self) -> Result<(), TransactionError> {
        tracing::trace!("local transaction begin");
        Ok(())
    }

    fn commit(&self) -> Result<(), TransactionError> {
        tracing::trace!("local transaction commit");
        Ok(())
    }

    fn rollback(&self) -> Result<(), TransactionError> {
        tracing::trace!("local transaction rollback");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_boundary_is_noop() {
        let boundary = LocalTransactionBoundary;
        boundary.begin().unwrap();
        boundary.commit().unwrap();
        boundary.rollback().unwrap();
    }

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::Commit("disk full".to_string());
        assert!(err.to_string().contains("commit"));
        assert!(err.to_string().contains("disk full"));
    }
}
