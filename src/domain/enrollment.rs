//! Enrollment records and the identities that act on them.
//!
//! `Enrollment` is the canonical representation. `LegacyProgressRecord` is the
//! older progress-table shape that is still mirrored while clients migrate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical enrollment of a user in a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Enrolled user
    pub user_id: i64,

    /// Course the user is enrolled in
    pub course_id: i64,

    /// Whether the enrollment is currently in effect
    pub status: EnrollmentStatus,

    /// Course progress percentage (0-100)
    pub progress: u8,

    /// When the enrollment was (re)activated
    pub enrolled_at: DateTime<Utc>,

    /// Latest known activity; only ever moves forward
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// Check if the enrollment is active
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

/// Lifecycle state of an enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown enrollment status: {}", other)),
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress row in the legacy schema, keyed by (student_id, course_id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyProgressRecord {
    pub student_id: i64,
    pub course_id: i64,
    pub total_progress: u8,
    pub completed_chapters: Vec<String>,
    pub watched_videos: Vec<String>,
    pub quiz_attempts: u32,
    pub last_accessed: DateTime<Utc>,
}

/// Role attached to a verified identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Instructor,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Instructor => "instructor",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Self::Student),
            "instructor" => Ok(Self::Instructor),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verified caller of an operation.
///
/// Supplied by the identity provider and trusted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: i64,
    pub role: UserRole,
}

impl Actor {
    pub fn new(user_id: i64, role: UserRole) -> Self {
        Self { user_id, role }
    }

    pub fn student(user_id: i64) -> Self {
        Self::new(user_id, UserRole::Student)
    }

    pub fn admin(user_id: i64) -> Self {
        Self::new(user_id, UserRole::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Whether this actor may act on behalf of `user_id`
    pub fn can_act_for(&self, user_id: i64) -> bool {
        self.is_admin() || self.user_id == user_id
    }
}

/// A user as reported by the identity directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub role: UserRole,
    pub active: bool,
}

/// A course as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub id: i64,
    pub title: String,
    pub published: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [EnrollmentStatus::Active, EnrollmentStatus::Cancelled] {
            assert_eq!(status.as_str().parse::<EnrollmentStatus>().unwrap(), status);
        }
        assert!("paused".parse::<EnrollmentStatus>().is_err());
    }

    #[test]
    fn test_actor_permissions() {
        let student = Actor::student(42);
        assert!(student.can_act_for(42));
        assert!(!student.can_act_for(43));

        let admin = Actor::admin(1);
        assert!(admin.can_act_for(42));
    }
}
