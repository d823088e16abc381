//! Domain types for the enrollment engine.
//!
//! This module contains the core data structures:
//! - Enrollment: canonical enrollment plus the legacy progress mirror
//! - Request: course access requests
//! - Events: immutable notifications of committed changes
//! - Params: inputs of the public operations
//! - Outcome: the result envelope of every operation

pub mod enrollment;
pub mod events;
pub mod outcome;
pub mod params;
pub mod request;

// Re-export commonly used types
pub use enrollment::{
    Actor, CourseInfo, Enrollment, EnrollmentStatus, LegacyProgressRecord, UserProfile, UserRole,
};
pub use events::{enrollment_entity_id, DomainEvent, DomainEventType};
pub use outcome::{ErrorKind, OperationError, OperationResult, OperationState};
pub use params::{EnrollmentKey, NewAccessRequest, ProgressUpdate, RequestReview};
pub use request::{AccessRequest, RequestStatus};
