//! Parameters of the public engine operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a (student, course) pair; used by enroll and unenroll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnrollmentKey {
    pub student_id: i64,
    pub course_id: i64,
}

impl EnrollmentKey {
    pub fn new(student_id: i64, course_id: i64) -> Self {
        Self {
            student_id,
            course_id,
        }
    }

    /// Idempotency scope of everything that mutates this pair
    pub fn scope(&self) -> String {
        format!("enrollment:{}:{}", self.student_id, self.course_id)
    }

    /// Ordered lock parameters
    pub fn lock_params(&self) -> Vec<String> {
        vec![self.student_id.to_string(), self.course_id.to_string()]
    }
}

/// A progress report from a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub student_id: i64,
    pub course_id: i64,

    /// Reported progress percentage; validated to 0-100
    pub progress: i32,

    /// When the client observed this progress
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub completed_chapters: Vec<String>,

    #[serde(default)]
    pub watched_videos: Vec<String>,

    #[serde(default)]
    pub quiz_attempts: Option<u32>,
}

impl ProgressUpdate {
    pub fn new(student_id: i64, course_id: i64, progress: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            student_id,
            course_id,
            progress,
            timestamp,
            completed_chapters: Vec::new(),
            watched_videos: Vec::new(),
            quiz_attempts: None,
        }
    }

    pub fn key(&self) -> EnrollmentKey {
        EnrollmentKey::new(self.student_id, self.course_id)
    }
}

/// A student's access request submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccessRequest {
    pub student_id: i64,
    pub course_id: i64,
    #[serde(default)]
    pub message: Option<String>,
}

impl NewAccessRequest {
    pub fn key(&self) -> EnrollmentKey {
        EnrollmentKey::new(self.student_id, self.course_id)
    }
}

/// An admin's decision on an access request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReview {
    pub request_id: i64,
    #[serde(default)]
    pub note: Option<String>,
}

impl RequestReview {
    pub fn new(request_id: i64) -> Self {
        Self {
            request_id,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
