//! Core engine logic.
//!
//! This module contains:
//! - LockManager: keyed advisory locks over the store
//! - IdempotencyStore: fingerprint-keyed result cache
//! - Validators: read-only precondition checks
//! - Synchronizer: transactional dual-table writes
//! - EventBus: in-process domain event delivery
//! - Orchestrator: the per-operation state machine

pub mod error;
pub mod events;
pub mod idempotency;
pub mod lock;
pub mod orchestrator;
pub mod sync;
pub mod validation;

// Re-export commonly used types
pub use error::EngineError;
pub use events::{EmitReport, EventBus, EventFilter, EventHandler, SubscriptionId};
pub use idempotency::{generate_key, IdempotencyCheck, IdempotencyStore, IdempotentOutcome};
pub use lock::{lock_key, LockAcquisition, LockId, LockManager};
pub use orchestrator::{
    Orchestrator, PurgeReport, OP_APPROVE, OP_CREATE_REQUEST, OP_ENROLL, OP_PROGRESS, OP_REJECT,
    OP_UNENROLL,
};
pub use sync::{DisabledMirror, LegacyMirror, Mutation, SqliteLegacyMirror, Synchronizer};
pub use validation::{IssueCode, ValidationIssue, ValidationResult, Validators};
