//! Error taxonomy for engine operations.
//!
//! Every variant maps onto an `OperationError` with a stable code and a
//! retryability flag the application layer uses to pick a response class.

use thiserror::Error;

use crate::domain::{ErrorKind, OperationError};
use crate::store::StoreError;

use super::validation::ValidationResult;

/// Errors that can end an orchestrated operation
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A precondition does not hold. Never retryable.
    #[error("{message}")]
    Validation { code: String, message: String },

    /// The operation lock was not acquired within the wait bound
    #[error("Lock '{operation}' busy: not acquired within {waited_ms}ms")]
    LockContention { operation: String, waited_ms: u64 },

    /// The store aborted the transaction; safe to retry
    #[error("Transaction aborted: {0}")]
    Transaction(String),

    /// Lock or idempotency subsystem unavailable (fail-closed policy)
    #[error("Infrastructure unavailable: {0}")]
    Infrastructure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a validation error from the errors of a failed validation
    pub fn from_validation(result: &ValidationResult) -> Self {
        let code = result
            .errors
            .first()
            .map(|issue| issue.code.as_str().to_string())
            .unwrap_or_else(|| "VALIDATION_FAILED".to_string());
        let message = result
            .errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self::Validation { code, message }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code,
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::Transaction(_) => "TRANSACTION_ERROR",
            Self::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::LockContention { .. } => ErrorKind::LockContention,
            Self::Transaction(_) => ErrorKind::Transaction,
            Self::Infrastructure(_) => ErrorKind::Infrastructure,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::Transaction(_) | Self::Infrastructure(_)
        )
    }

    pub fn to_operation_error(&self) -> OperationError {
        OperationError {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            kind: self.kind(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        if err.is_busy() || err.is_constraint() {
            Self::Transaction(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_kind() {
        assert!(!EngineError::validation("NOT_ENROLLED", "no").is_retryable());
        assert!(EngineError::LockContention {
            operation: "enrollment".to_string(),
            waited_ms: 10
        }
        .is_retryable());
        assert!(EngineError::Transaction("busy".to_string()).is_retryable());
        assert!(!EngineError::Internal("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_operation_error_mapping() {
        let err = EngineError::validation("REQUEST_ALREADY_RESOLVED", "request 3 is approved");
        let op = err.to_operation_error();
        assert_eq!(op.code, "REQUEST_ALREADY_RESOLVED");
        assert_eq!(op.message, "request 3 is approved");
        assert_eq!(op.kind, ErrorKind::Validation);
        assert!(!op.retryable);
    }

    #[test]
    fn test_busy_store_error_is_transaction() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        let err = EngineError::from(busy);
        assert_eq!(err.code(), "TRANSACTION_ERROR");
        assert!(err.is_retryable());
    }
}
