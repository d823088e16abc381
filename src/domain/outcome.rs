//! Results returned by every public engine operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one orchestrated operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,

    /// Operation payload (the resulting entity) on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,

    /// Unique id of this invocation (not of the cached result)
    pub operation_id: Uuid,

    /// Operation name ("enroll_student", ...)
    pub operation: String,

    pub timestamp: DateTime<Utc>,

    /// True when the result was served without executing a mutation
    #[serde(default)]
    pub was_duplicate: bool,

    /// State machine trail of this invocation
    #[serde(default)]
    pub states: Vec<OperationState>,
}

impl OperationResult {
    pub fn success(operation: &str, operation_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            operation_id,
            operation: operation.to_string(),
            timestamp: Utc::now(),
            was_duplicate: false,
            states: Vec::new(),
        }
    }

    pub fn failure(operation: &str, operation_id: Uuid, error: OperationError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            operation_id,
            operation: operation.to_string(),
            timestamp: Utc::now(),
            was_duplicate: false,
            states: Vec::new(),
        }
    }

    pub fn duplicate(mut self) -> Self {
        self.was_duplicate = true;
        self
    }

    pub fn with_states(mut self, states: Vec<OperationState>) -> Self {
        self.states = states;
        self
    }

    /// Error code, if the operation failed
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Whether the caller may retry this operation
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().map(|e| e.retryable).unwrap_or(false)
    }
}

/// Error surfaced to the application layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Stable machine code ("ALREADY_ENROLLED", "LOCK_CONTENTION", ...)
    pub code: String,

    pub message: String,

    pub retryable: bool,

    pub kind: ErrorKind,
}

/// Error category from the engine's taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    LockContention,
    Transaction,
    Infrastructure,
    Internal,
}

/// States of the orchestration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Requested,
    LockAcquired,
    Validated,
    IdempotentHit,
    ReturnCached,
    Executing,
    Committed,
    EventEmitted,
    Failed,
    LockReleased,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_accessors() {
        let result = OperationResult::failure(
            "enroll_student",
            Uuid::new_v4(),
            OperationError {
                code: "LOCK_CONTENTION".to_string(),
                message: "busy".to_string(),
                retryable: true,
                kind: ErrorKind::LockContention,
            },
        );

        assert!(!result.success);
        assert_eq!(result.error_code(), Some("LOCK_CONTENTION"));
        assert!(result.is_retryable());
    }

    #[test]
    fn test_success_serialization_omits_error() {
        let result = OperationResult::success(
            "update_progress",
            Uuid::new_v4(),
            serde_json::json!({ "progress": 40 }),
        )
        .with_states(vec![OperationState::Requested, OperationState::LockReleased]);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["states"][1], "LOCK_RELEASED");
    }
}
