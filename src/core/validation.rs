//! Read-only precondition checks for engine operations.
//!
//! Validators never mutate. They run before the mutation transaction, so
//! the synchronizer re-checks the invariants that matter inside its own
//! transaction. A validator result is advisory; the transaction is
//! authoritative.
//!
//! "Already enrolled" is always an error here. The orchestrator is the
//! layer that turns it into an idempotent success for `enroll_student`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::EngineError;
use crate::adapters::{CourseCatalog, UserDirectory};
use crate::domain::{
    Actor, EnrollmentKey, NewAccessRequest, ProgressUpdate, RequestStatus, UserRole,
};
use crate::store::{records, Database};

/// Machine-readable validation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    Forbidden,
    UserNotFound,
    UserInactive,
    InvalidRole,
    CourseNotFound,
    CourseNotPublished,
    AlreadyEnrolled,
    NotEnrolled,
    PendingRequestExists,
    RequestAlreadyPending,
    RequestNotFound,
    RequestAlreadyResolved,
    ProgressOutOfRange,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forbidden => "FORBIDDEN",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserInactive => "USER_INACTIVE",
            Self::InvalidRole => "INVALID_ROLE",
            Self::CourseNotFound => "COURSE_NOT_FOUND",
            Self::CourseNotPublished => "COURSE_NOT_PUBLISHED",
            Self::AlreadyEnrolled => "ALREADY_ENROLLED",
            Self::NotEnrolled => "NOT_ENROLLED",
            Self::PendingRequestExists => "PENDING_REQUEST_EXISTS",
            Self::RequestAlreadyPending => "REQUEST_ALREADY_PENDING",
            Self::RequestNotFound => "REQUEST_NOT_FOUND",
            Self::RequestAlreadyResolved => "REQUEST_ALREADY_RESOLVED",
            Self::ProgressOutOfRange => "PROGRESS_OUT_OF_RANGE",
        }
    }
}

impl IssueCode {
    /// Codes meaning the operation's target state already holds, as
    /// opposed to the caller or its references being unacceptable
    pub fn is_settled_state(&self) -> bool {
        matches!(
            self,
            Self::AlreadyEnrolled
                | Self::NotEnrolled
                | Self::RequestAlreadyPending
                | Self::RequestAlreadyResolved
        )
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
}

/// Outcome of a validation pass
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, code: IssueCode, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(ValidationIssue {
            code,
            message: message.into(),
        });
    }

    pub fn warn(&mut self, code: IssueCode, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            code,
            message: message.into(),
        });
    }

    pub fn has_error(&self, code: IssueCode) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }

    pub fn has_warning(&self, code: IssueCode) -> bool {
        self.warnings.iter().any(|issue| issue.code == code)
    }

    /// True when failing only because the target state already holds
    pub fn fails_only_on_settled_state(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|issue| issue.code.is_settled_state())
    }

    /// True when the only errors carry `code`
    pub fn fails_only_with(&self, code: IssueCode) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|issue| issue.code == code)
    }
}

/// Validators for every engine operation
#[derive(Clone)]
pub struct Validators {
    db: Database,
    users: Arc<dyn UserDirectory>,
    courses: Arc<dyn CourseCatalog>,
}

impl Validators {
    pub fn new(db: Database, users: Arc<dyn UserDirectory>, courses: Arc<dyn CourseCatalog>) -> Self {
        Self { db, users, courses }
    }

    /// Enroll: student and course usable, not already enrolled
    pub async fn validate_enroll(
        &self,
        actor: &Actor,
        key: &EnrollmentKey,
    ) -> Result<ValidationResult, EngineError> {
        let mut result = ValidationResult::new();
        self.check_actor(actor, key.student_id, &mut result);
        self.check_student(key.student_id, &mut result).await?;
        self.check_course(key.course_id, &mut result).await?;

        if self.is_enrolled(key)? {
            result.error(
                IssueCode::AlreadyEnrolled,
                format!(
                    "Student {} is already enrolled in course {}",
                    key.student_id, key.course_id
                ),
            );
        }

        let pending = self
            .db
            .with_conn(|conn| records::pending_request_for(conn, key.student_id, key.course_id))?;
        if let Some(request) = pending {
            result.warn(
                IssueCode::PendingRequestExists,
                format!("Pending access request {} will be cleared", request.id),
            );
        }

        Ok(result)
    }

    /// Unenroll: an active enrollment exists
    pub async fn validate_unenroll(
        &self,
        actor: &Actor,
        key: &EnrollmentKey,
    ) -> Result<ValidationResult, EngineError> {
        let mut result = ValidationResult::new();
        self.check_actor(actor, key.student_id, &mut result);

        if !self.is_enrolled(key)? {
            result.error(
                IssueCode::NotEnrolled,
                format!(
                    "Student {} is not enrolled in course {}",
                    key.student_id, key.course_id
                ),
            );
        }

        Ok(result)
    }

    /// Progress: value in range and an active enrollment exists
    pub async fn validate_progress(
        &self,
        actor: &Actor,
        update: &ProgressUpdate,
    ) -> Result<ValidationResult, EngineError> {
        let mut result = ValidationResult::new();
        self.check_actor(actor, update.student_id, &mut result);

        if !(0..=100).contains(&update.progress) {
            result.error(
                IssueCode::ProgressOutOfRange,
                format!("Progress must be between 0 and 100, got {}", update.progress),
            );
        }

        if !self.is_enrolled(&update.key())? {
            result.error(
                IssueCode::NotEnrolled,
                format!(
                    "Student {} is not enrolled in course {}",
                    update.student_id, update.course_id
                ),
            );
        }

        Ok(result)
    }

    /// Create request: usable student/course, not enrolled, nothing pending
    pub async fn validate_create_request(
        &self,
        actor: &Actor,
        request: &NewAccessRequest,
    ) -> Result<ValidationResult, EngineError> {
        let key = request.key();
        let mut result = ValidationResult::new();
        self.check_actor(actor, key.student_id, &mut result);
        self.check_student(key.student_id, &mut result).await?;
        self.check_course(key.course_id, &mut result).await?;

        if self.is_enrolled(&key)? {
            result.error(
                IssueCode::AlreadyEnrolled,
                format!(
                    "Student {} is already enrolled in course {}",
                    key.student_id, key.course_id
                ),
            );
        }

        let pending = self
            .db
            .with_conn(|conn| records::pending_request_for(conn, key.student_id, key.course_id))?;
        if let Some(existing) = pending {
            result.error(
                IssueCode::RequestAlreadyPending,
                format!("Access request {} is already pending", existing.id),
            );
        }

        Ok(result)
    }

    /// Approve/reject: admin actor, request exists and is still pending.
    /// Approval additionally re-checks the student and course.
    pub async fn validate_review(
        &self,
        actor: &Actor,
        request_id: i64,
        approving: bool,
    ) -> Result<ValidationResult, EngineError> {
        let mut result = ValidationResult::new();

        if !actor.is_admin() {
            result.error(
                IssueCode::Forbidden,
                format!("User {} may not review access requests", actor.user_id),
            );
        }

        let request = self.db.with_conn(|conn| records::get_request(conn, request_id))?;
        let Some(request) = request else {
            result.error(
                IssueCode::RequestNotFound,
                format!("Access request {} does not exist", request_id),
            );
            return Ok(result);
        };

        if request.status != RequestStatus::Pending {
            result.error(
                IssueCode::RequestAlreadyResolved,
                format!(
                    "Access request {} is already {}",
                    request_id, request.status
                ),
            );
        }

        if approving {
            self.check_student(request.student_id, &mut result).await?;
            self.check_course(request.course_id, &mut result).await?;
        }

        Ok(result)
    }

    fn check_actor(&self, actor: &Actor, student_id: i64, result: &mut ValidationResult) {
        if !actor.can_act_for(student_id) {
            result.error(
                IssueCode::Forbidden,
                format!("User {} may not act for student {}", actor.user_id, student_id),
            );
        }
    }

    async fn check_student(
        &self,
        student_id: i64,
        result: &mut ValidationResult,
    ) -> Result<(), EngineError> {
        let user = self
            .users
            .find_user(student_id)
            .await
            .map_err(|e| EngineError::Infrastructure(format!("user directory: {:#}", e)))?;

        match user {
            None => result.error(
                IssueCode::UserNotFound,
                format!("User {} does not exist", student_id),
            ),
            Some(user) if !user.active => result.error(
                IssueCode::UserInactive,
                format!("User {} is not active", student_id),
            ),
            Some(user) if user.role != UserRole::Student => result.error(
                IssueCode::InvalidRole,
                format!("User {} has role {}, expected student", student_id, user.role),
            ),
            Some(_) => {}
        }
        Ok(())
    }

    async fn check_course(
        &self,
        course_id: i64,
        result: &mut ValidationResult,
    ) -> Result<(), EngineError> {
        let course = self
            .courses
            .find_course(course_id)
            .await
            .map_err(|e| EngineError::Infrastructure(format!("course catalog: {:#}", e)))?;

        match course {
            None => result.error(
                IssueCode::CourseNotFound,
                format!("Course {} does not exist", course_id),
            ),
            Some(course) if !course.published => result.error(
                IssueCode::CourseNotPublished,
                format!("Course {} is not published", course_id),
            ),
            Some(_) => {}
        }
        Ok(())
    }

    fn is_enrolled(&self, key: &EnrollmentKey) -> Result<bool, EngineError> {
        let enrollment = self
            .db
            .with_conn(|conn| records::get_enrollment(conn, key.student_id, key.course_id))?;
        Ok(enrollment.map(|e| e.is_active()).unwrap_or(false))
    }
}
