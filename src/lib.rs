//! enrollsync - Enrollment consistency and idempotent operation engine
//!
//! Serializes, deduplicates and validates enrollment mutations issued by
//! concurrent callers, keeps the canonical enrollment table and the legacy
//! progress table in lockstep, and publishes domain events after commit.
//!
//! # Architecture
//!
//! Each public operation runs one state machine:
//! - acquire an advisory lock keyed by the resource
//! - validate preconditions
//! - replay a cached result or execute the mutation in one transaction
//! - record the result, emit events, release the lock
//!
//! # Modules
//!
//! - `adapters`: Directory/catalog integrations (SQLite)
//! - `core`: Locks, idempotency, validation, sync, events, orchestrator
//! - `domain`: Data structures (Enrollment, AccessRequest, DomainEvent)
//! - `store`: SQLite schema and row access
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Enroll a student
//! enrollsync enroll 42 7 --actor 42 --role student
//!
//! # Inspect both tables
//! enrollsync status 42 7
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{EngineError, EventBus, EventFilter, Orchestrator};
pub use domain::{
    AccessRequest, Actor, DomainEvent, DomainEventType, Enrollment, EnrollmentKey,
    LegacyProgressRecord, NewAccessRequest, OperationResult, OperationState, ProgressUpdate,
    RequestReview, UserRole,
};
pub use store::Database;
