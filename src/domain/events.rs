//! Domain events published after a state change commits.
//!
//! Events are immutable notifications for real-time sync consumers. They are
//! never persisted; the relational store stays the source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enrollment::Actor;

/// A single committed state change.
///
/// Only constructed once the mutation it describes has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// What happened
    #[serde(rename = "type")]
    pub event_type: DomainEventType,

    /// Entity kind ("enrollment", "access_request")
    pub entity: String,

    /// Identifier of the entity within its kind
    pub entity_id: String,

    /// Verb describing the change ("created", "removed", ...)
    pub action: String,

    /// Who caused the change
    pub actor: Actor,

    /// Operation-specific details
    pub metadata: serde_json::Value,

    /// When the event was created (after commit)
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Create a new event with the current timestamp
    pub fn new(event_type: DomainEventType, entity_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity: event_type.entity().to_string(),
            entity_id: entity_id.into(),
            action: event_type.action().to_string(),
            actor,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Attach metadata to the event
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Types of domain events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEventType {
    /// A student gained (or regained) active access to a course
    EnrollmentCreated,

    /// An enrollment was cancelled
    EnrollmentRemoved,

    /// Progress was merged into an enrollment
    ProgressUpdated,

    /// A student asked for course access
    RequestCreated,

    /// An admin approved an access request
    RequestApproved,

    /// An admin rejected an access request
    RequestRejected,
}

impl DomainEventType {
    /// Entity kind this event type refers to
    pub fn entity(&self) -> &'static str {
        match self {
            Self::EnrollmentCreated | Self::EnrollmentRemoved | Self::ProgressUpdated => {
                "enrollment"
            }
            Self::RequestCreated | Self::RequestApproved | Self::RequestRejected => {
                "access_request"
            }
        }
    }

    /// Action verb for this event type
    pub fn action(&self) -> &'static str {
        match self {
            Self::EnrollmentCreated | Self::RequestCreated => "created",
            Self::EnrollmentRemoved => "removed",
            Self::ProgressUpdated => "updated",
            Self::RequestApproved => "approved",
            Self::RequestRejected => "rejected",
        }
    }
}

/// Entity id used for enrollment events: "{user_id}:{course_id}"
pub fn enrollment_entity_id(user_id: i64, course_id: i64) -> String {
    format!("{}:{}", user_id, course_id)
}
