//! Transactional writes for enrollments, progress and access requests.
//!
//! Every mutation runs in a single IMMEDIATE transaction that re-checks the
//! invariants validators already looked at, so the race window between
//! validation and commit is closed here. Events are built only after the
//! transaction has committed.
//!
//! The legacy progress table is written through a `LegacyMirror`, so it
//! can be retired without touching this module's callers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use tracing::debug;

use super::error::EngineError;
use super::validation::IssueCode;
use crate::domain::{
    enrollment_entity_id, AccessRequest, Actor, DomainEvent, DomainEventType, Enrollment,
    EnrollmentKey, EnrollmentStatus, LegacyProgressRecord, NewAccessRequest, ProgressUpdate,
    RequestReview, RequestStatus,
};
use crate::store::{records, Database, StoreError};

/// Writer for the legacy representation of an enrollment.
///
/// Called inside the synchronizer's transaction; an error rolls back the
/// canonical write too.
pub trait LegacyMirror: Send + Sync {
    fn name(&self) -> &str;

    /// Progress already recorded in the legacy table, if any
    fn existing_progress(
        &self,
        conn: &Connection,
        key: &EnrollmentKey,
    ) -> Result<Option<u8>, StoreError>;

    /// Reflect a newly active enrollment
    fn on_enrolled(&self, conn: &Connection, enrollment: &Enrollment) -> Result<(), StoreError>;

    /// Reflect merged progress
    fn on_progress(
        &self,
        conn: &Connection,
        enrollment: &Enrollment,
        update: &ProgressUpdate,
    ) -> Result<(), StoreError>;

    /// Reflect a cancelled enrollment
    fn on_unenrolled(&self, conn: &Connection, key: &EnrollmentKey) -> Result<(), StoreError>;
}

/// Mirrors enrollments into the `legacy_progress` table
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteLegacyMirror;

impl LegacyMirror for SqliteLegacyMirror {
    fn name(&self) -> &str {
        "legacy_progress"
    }

    fn existing_progress(
        &self,
        conn: &Connection,
        key: &EnrollmentKey,
    ) -> Result<Option<u8>, StoreError> {
        Ok(records::get_legacy_progress(conn, key.student_id, key.course_id)?
            .map(|record| record.total_progress))
    }

    fn on_enrolled(&self, conn: &Connection, enrollment: &Enrollment) -> Result<(), StoreError> {
        let existing =
            records::get_legacy_progress(conn, enrollment.user_id, enrollment.course_id)?;

        let record = match existing {
            Some(mut record) => {
                record.total_progress = enrollment.progress;
                record.last_accessed = record.last_accessed.max(enrollment.updated_at);
                record
            }
            None => LegacyProgressRecord {
                student_id: enrollment.user_id,
                course_id: enrollment.course_id,
                total_progress: enrollment.progress,
                completed_chapters: Vec::new(),
                watched_videos: Vec::new(),
                quiz_attempts: 0,
                last_accessed: enrollment.updated_at,
            },
        };
        records::upsert_legacy_progress(conn, &record)
    }

    fn on_progress(
        &self,
        conn: &Connection,
        enrollment: &Enrollment,
        update: &ProgressUpdate,
    ) -> Result<(), StoreError> {
        let mut record = records::get_legacy_progress(conn, enrollment.user_id, enrollment.course_id)?
            .unwrap_or_else(|| LegacyProgressRecord {
                student_id: enrollment.user_id,
                course_id: enrollment.course_id,
                total_progress: 0,
                completed_chapters: Vec::new(),
                watched_videos: Vec::new(),
                quiz_attempts: 0,
                last_accessed: update.timestamp,
            });

        record.total_progress = enrollment.progress;
        merge_unique(&mut record.completed_chapters, &update.completed_chapters);
        merge_unique(&mut record.watched_videos, &update.watched_videos);
        if let Some(attempts) = update.quiz_attempts {
            record.quiz_attempts = record.quiz_attempts.max(attempts);
        }
        record.last_accessed = record.last_accessed.max(update.timestamp);

        records::upsert_legacy_progress(conn, &record)
    }

    fn on_unenrolled(&self, conn: &Connection, key: &EnrollmentKey) -> Result<(), StoreError> {
        records::delete_legacy_progress(conn, key.student_id, key.course_id)?;
        Ok(())
    }
}

/// Mirror used once the legacy table is retired
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledMirror;

impl LegacyMirror for DisabledMirror {
    fn name(&self) -> &str {
        "disabled"
    }

    fn existing_progress(&self, _: &Connection, _: &EnrollmentKey) -> Result<Option<u8>, StoreError> {
        Ok(None)
    }

    fn on_enrolled(&self, _: &Connection, _: &Enrollment) -> Result<(), StoreError> {
        Ok(())
    }

    fn on_progress(&self, _: &Connection, _: &Enrollment, _: &ProgressUpdate) -> Result<(), StoreError> {
        Ok(())
    }

    fn on_unenrolled(&self, _: &Connection, _: &EnrollmentKey) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Result of a committed mutation
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Payload returned to the caller
    pub data: serde_json::Value,

    /// Events to publish, built after commit
    pub events: Vec<DomainEvent>,
}

/// What the enroll path did inside its transaction
enum EnrollEffect {
    Enrolled {
        enrollment: Enrollment,
        reactivated: bool,
        cleared_requests: usize,
    },
    AlreadyActive(Enrollment),
}

impl EnrollEffect {
    fn enrollment(&self) -> &Enrollment {
        match self {
            Self::Enrolled { enrollment, .. } | Self::AlreadyActive(enrollment) => enrollment,
        }
    }

    /// Event for a newly active enrollment, or None for a no-op
    fn event(&self, actor: Actor, via_request: Option<i64>) -> Option<DomainEvent> {
        match self {
            Self::Enrolled {
                enrollment,
                reactivated,
                cleared_requests,
            } => Some(
                DomainEvent::new(
                    DomainEventType::EnrollmentCreated,
                    enrollment_entity_id(enrollment.user_id, enrollment.course_id),
                    actor,
                )
                .with_metadata(json!({
                    "user_id": enrollment.user_id,
                    "course_id": enrollment.course_id,
                    "progress": enrollment.progress,
                    "reactivated": reactivated,
                    "cleared_requests": cleared_requests,
                    "request_id": via_request,
                })),
            ),
            Self::AlreadyActive(_) => None,
        }
    }
}

/// Executes dual-table writes
#[derive(Clone)]
pub struct Synchronizer {
    db: Database,
    mirror: Arc<dyn LegacyMirror>,
}

impl Synchronizer {
    pub fn new(db: Database, mirror: Arc<dyn LegacyMirror>) -> Self {
        Self { db, mirror }
    }

    pub fn mirror_name(&self) -> &str {
        self.mirror.name()
    }

    /// Activate an enrollment, mirror it, and clear pending requests.
    ///
    /// An already-active enrollment is returned unchanged with no events.
    pub fn enroll(
        &self,
        actor: Actor,
        key: &EnrollmentKey,
        now: DateTime<Utc>,
    ) -> Result<Mutation, EngineError> {
        let effect = self
            .db
            .transact(|tx| self.enroll_in_tx(tx, key, now))?;

        let data = json!({
            "enrollment": effect.enrollment(),
            "changed": matches!(effect, EnrollEffect::Enrolled { .. }),
        });
        let events = effect.event(actor, None).into_iter().collect();
        Ok(Mutation { data, events })
    }

    /// Cancel an active enrollment and drop its legacy mirror row
    pub fn unenroll(
        &self,
        actor: Actor,
        key: &EnrollmentKey,
        now: DateTime<Utc>,
    ) -> Result<Mutation, EngineError> {
        let enrollment = self.db.transact(|tx| {
            let existing = records::get_enrollment(tx, key.student_id, key.course_id)?;
            if !existing.map(|e| e.is_active()).unwrap_or(false) {
                return Err(not_enrolled(key));
            }

            records::set_enrollment_status(
                tx,
                key.student_id,
                key.course_id,
                EnrollmentStatus::Cancelled,
                now,
            )?;
            self.mirror.on_unenrolled(tx, key)?;

            records::get_enrollment(tx, key.student_id, key.course_id)?
                .ok_or_else(|| EngineError::Internal("enrollment vanished".to_string()))
        })?;

        debug!(student_id = key.student_id, course_id = key.course_id, "Enrollment cancelled");

        let event = DomainEvent::new(
            DomainEventType::EnrollmentRemoved,
            enrollment_entity_id(key.student_id, key.course_id),
            actor,
        )
        .with_metadata(json!({
            "user_id": key.student_id,
            "course_id": key.course_id,
            "final_progress": enrollment.progress,
        }));

        Ok(Mutation {
            data: json!({ "enrollment": enrollment }),
            events: vec![event],
        })
    }

    /// Merge a progress report monotonically.
    ///
    /// Stored progress becomes `max(stored, reported)` and the activity time
    /// becomes the later of the two timestamps, so out-of-order reports
    /// never move either backwards.
    pub fn update_progress(&self, actor: Actor, update: &ProgressUpdate) -> Result<Mutation, EngineError> {
        let key = update.key();
        let reported = u8::try_from(update.progress)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                EngineError::validation(
                    IssueCode::ProgressOutOfRange.as_str(),
                    format!("Progress {} is outside 0..=100", update.progress),
                )
            })?;

        let (before, after) = self.db.transact(|tx| {
            let existing = records::get_enrollment(tx, key.student_id, key.course_id)?
                .filter(|e| e.is_active())
                .ok_or_else(|| not_enrolled(&key))?;

            let progress = existing.progress.max(reported);
            let updated_at = existing.updated_at.max(update.timestamp);
            records::write_enrollment_progress(tx, key.student_id, key.course_id, progress, updated_at)?;

            let merged = Enrollment {
                progress,
                updated_at,
                ..existing.clone()
            };
            self.mirror.on_progress(tx, &merged, update)?;

            Ok::<_, EngineError>((existing, merged))
        })?;

        let advanced = after.progress > before.progress;
        let event = DomainEvent::new(
            DomainEventType::ProgressUpdated,
            enrollment_entity_id(key.student_id, key.course_id),
            actor,
        )
        .with_metadata(json!({
            "user_id": key.student_id,
            "course_id": key.course_id,
            "progress": after.progress,
            "reported": reported,
            "previous": before.progress,
            "advanced": advanced,
        }));

        Ok(Mutation {
            data: json!({ "enrollment": after, "advanced": advanced }),
            events: vec![event],
        })
    }

    /// Record a new pending access request
    pub fn create_request(
        &self,
        actor: Actor,
        request: &NewAccessRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, EngineError> {
        let key = request.key();

        let created = self.db.transact(|tx| {
            let enrolled = records::get_enrollment(tx, key.student_id, key.course_id)?
                .map(|e| e.is_active())
                .unwrap_or(false);
            if enrolled {
                return Err(EngineError::validation(
                    IssueCode::AlreadyEnrolled.as_str(),
                    format!(
                        "Student {} is already enrolled in course {}",
                        key.student_id, key.course_id
                    ),
                ));
            }
            if let Some(existing) = records::pending_request_for(tx, key.student_id, key.course_id)? {
                return Err(EngineError::validation(
                    IssueCode::RequestAlreadyPending.as_str(),
                    format!("Access request {} is already pending", existing.id),
                ));
            }

            Ok(records::insert_request(
                tx,
                key.student_id,
                key.course_id,
                request.message.as_deref(),
                now,
            )?)
        })?;

        let event = request_event(DomainEventType::RequestCreated, &created, actor);
        Ok(Mutation {
            data: json!({ "request": created }),
            events: vec![event],
        })
    }

    /// Approve a pending request and enroll the student in the same transaction
    pub fn approve_request(
        &self,
        actor: Actor,
        review: &RequestReview,
        now: DateTime<Utc>,
    ) -> Result<Mutation, EngineError> {
        let (request, effect) = self.db.transact(|tx| {
            let request = self.resolve_in_tx(tx, review, RequestStatus::Approved, actor, now)?;
            let key = EnrollmentKey::new(request.student_id, request.course_id);
            let effect = self.enroll_in_tx(tx, &key, now)?;
            Ok::<_, EngineError>((request, effect))
        })?;

        let mut events = vec![request_event(DomainEventType::RequestApproved, &request, actor)];
        events.extend(effect.event(actor, Some(request.id)));

        Ok(Mutation {
            data: json!({
                "request": request,
                "enrollment": effect.enrollment(),
            }),
            events,
        })
    }

    /// Reject a pending request
    pub fn reject_request(
        &self,
        actor: Actor,
        review: &RequestReview,
        now: DateTime<Utc>,
    ) -> Result<Mutation, EngineError> {
        let request = self
            .db
            .transact(|tx| self.resolve_in_tx(tx, review, RequestStatus::Rejected, actor, now))?;

        let event = request_event(DomainEventType::RequestRejected, &request, actor);
        Ok(Mutation {
            data: json!({ "request": request }),
            events: vec![event],
        })
    }

    fn enroll_in_tx(
        &self,
        conn: &Connection,
        key: &EnrollmentKey,
        now: DateTime<Utc>,
    ) -> Result<EnrollEffect, EngineError> {
        let existing = records::get_enrollment(conn, key.student_id, key.course_id)?;
        if let Some(enrollment) = existing.as_ref().filter(|e| e.is_active()) {
            // Pending requests must not outlive an active enrollment
            records::delete_pending_requests(conn, key.student_id, key.course_id)?;
            return Ok(EnrollEffect::AlreadyActive(enrollment.clone()));
        }

        let initial = self.mirror.existing_progress(conn, key)?.unwrap_or(0);
        let enrollment =
            records::upsert_active_enrollment(conn, key.student_id, key.course_id, initial, now)?;
        self.mirror.on_enrolled(conn, &enrollment)?;
        let cleared_requests =
            records::delete_pending_requests(conn, key.student_id, key.course_id)?;

        debug!(
            student_id = key.student_id,
            course_id = key.course_id,
            progress = initial,
            cleared_requests,
            "Enrollment activated"
        );

        Ok(EnrollEffect::Enrolled {
            enrollment,
            reactivated: existing.is_some(),
            cleared_requests,
        })
    }

    fn resolve_in_tx(
        &self,
        conn: &Connection,
        review: &RequestReview,
        status: RequestStatus,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> Result<AccessRequest, EngineError> {
        let request = records::get_request(conn, review.request_id)?.ok_or_else(|| {
            EngineError::validation(
                IssueCode::RequestNotFound.as_str(),
                format!("Access request {} does not exist", review.request_id),
            )
        })?;

        if request.status != RequestStatus::Pending {
            return Err(already_resolved(&request));
        }

        let changed = records::resolve_request(
            conn,
            review.request_id,
            status,
            actor.user_id,
            review.note.as_deref(),
            now,
        )?;
        if changed == 0 {
            return Err(already_resolved(&request));
        }

        records::get_request(conn, review.request_id)?
            .ok_or_else(|| EngineError::Internal("access request vanished".to_string()))
    }
}

fn not_enrolled(key: &EnrollmentKey) -> EngineError {
    EngineError::validation(
        IssueCode::NotEnrolled.as_str(),
        format!(
            "Student {} is not enrolled in course {}",
            key.student_id, key.course_id
        ),
    )
}

fn already_resolved(request: &AccessRequest) -> EngineError {
    EngineError::validation(
        IssueCode::RequestAlreadyResolved.as_str(),
        format!("Access request {} is already {}", request.id, request.status),
    )
}

fn request_event(event_type: DomainEventType, request: &AccessRequest, actor: Actor) -> DomainEvent {
    DomainEvent::new(event_type, request.id.to_string(), actor).with_metadata(json!({
        "request_id": request.id,
        "student_id": request.student_id,
        "course_id": request.course_id,
        "status": request.status,
        "reviewed_by": request.reviewed_by,
        "review_note": request.review_note,
    }))
}

/// Append items not already present, keeping first-seen order
fn merge_unique(target: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sync_with(mirror: Arc<dyn LegacyMirror>) -> (Synchronizer, Database) {
        let db = Database::open_in_memory().unwrap();
        (Synchronizer::new(db.clone(), mirror), db)
    }

    fn legacy(db: &Database, student: i64, course: i64) -> Option<LegacyProgressRecord> {
        db.with_conn(|c| records::get_legacy_progress(c, student, course))
            .unwrap()
    }

    #[test]
    fn test_enroll_writes_both_tables_and_clears_pending() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let now = Utc::now();
        db.write_tx(|tx| records::insert_request(tx, 42, 7, None, now))
            .unwrap();

        let mutation = sync.enroll(Actor::student(42), &EnrollmentKey::new(42, 7), now).unwrap();
        assert_eq!(mutation.events.len(), 1);
        assert_eq!(mutation.events[0].metadata["cleared_requests"], 1);

        let legacy = legacy(&db, 42, 7).unwrap();
        assert_eq!(legacy.total_progress, 0);
        assert!(db
            .with_conn(|c| records::pending_request_for(c, 42, 7))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_out_of_range_progress_is_rejected() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let key = EnrollmentKey::new(42, 7);
        sync.enroll(Actor::student(42), &key, Utc::now()).unwrap();

        for progress in [101, -5] {
            let err = sync
                .update_progress(Actor::student(42), &ProgressUpdate::new(42, 7, progress, Utc::now()))
                .unwrap_err();
            assert_eq!(err.code(), "PROGRESS_OUT_OF_RANGE");
        }

        let enrollment = db
            .with_conn(|c| records::get_enrollment(c, 42, 7))
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.progress, 0);
    }

    #[test]
    fn test_enroll_twice_is_noop() {
        let (sync, _db) = sync_with(Arc::new(SqliteLegacyMirror));
        let key = EnrollmentKey::new(42, 7);

        sync.enroll(Actor::student(42), &key, Utc::now()).unwrap();
        let again = sync.enroll(Actor::student(42), &key, Utc::now()).unwrap();
        assert!(again.events.is_empty());
        assert_eq!(again.data["changed"], false);
    }

    #[test]
    fn test_enroll_adopts_legacy_progress() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let earlier = Utc::now() - Duration::days(3);
        db.write_tx(|tx| {
            records::upsert_legacy_progress(
                tx,
                &LegacyProgressRecord {
                    student_id: 5,
                    course_id: 3,
                    total_progress: 55,
                    completed_chapters: vec!["intro".to_string()],
                    watched_videos: Vec::new(),
                    quiz_attempts: 1,
                    last_accessed: earlier,
                },
            )
        })
        .unwrap();

        let mutation = sync.enroll(Actor::student(5), &EnrollmentKey::new(5, 3), Utc::now()).unwrap();
        assert_eq!(mutation.data["enrollment"]["progress"], 55);

        let legacy = legacy(&db, 5, 3).unwrap();
        assert_eq!(legacy.total_progress, 55);
        assert_eq!(legacy.completed_chapters, vec!["intro".to_string()]);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let t1 = Utc::now();
        let t2 = t1 + Duration::minutes(5);
        sync.enroll(Actor::student(5), &EnrollmentKey::new(5, 3), t1).unwrap();

        let mut first = ProgressUpdate::new(5, 3, 40, t1);
        first.completed_chapters = vec!["ch-1".to_string()];
        sync.update_progress(Actor::student(5), &first).unwrap();

        let mut second = ProgressUpdate::new(5, 3, 30, t2);
        second.completed_chapters = vec!["ch-1".to_string(), "ch-2".to_string()];
        let mutation = sync.update_progress(Actor::student(5), &second).unwrap();
        assert_eq!(mutation.data["advanced"], false);

        let enrollment = db
            .with_conn(|c| records::get_enrollment(c, 5, 3))
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.progress, 40);
        assert_eq!(enrollment.updated_at.timestamp_millis(), t2.timestamp_millis());

        let legacy = legacy(&db, 5, 3).unwrap();
        assert_eq!(legacy.total_progress, 40);
        assert_eq!(legacy.completed_chapters, vec!["ch-1".to_string(), "ch-2".to_string()]);
        assert_eq!(legacy.last_accessed.timestamp_millis(), t2.timestamp_millis());
    }

    #[test]
    fn test_stale_timestamp_does_not_rewind_activity() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let t1 = Utc::now();
        sync.enroll(Actor::student(5), &EnrollmentKey::new(5, 3), t1).unwrap();

        let late = t1 + Duration::minutes(10);
        sync.update_progress(Actor::student(5), &ProgressUpdate::new(5, 3, 20, late)).unwrap();
        sync.update_progress(Actor::student(5), &ProgressUpdate::new(5, 3, 60, t1)).unwrap();

        let enrollment = db
            .with_conn(|c| records::get_enrollment(c, 5, 3))
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.progress, 60);
        assert_eq!(enrollment.updated_at.timestamp_millis(), late.timestamp_millis());
    }

    #[test]
    fn test_unenroll_removes_mirror() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let key = EnrollmentKey::new(42, 7);
        sync.enroll(Actor::student(42), &key, Utc::now()).unwrap();

        sync.unenroll(Actor::student(42), &key, Utc::now()).unwrap();
        assert!(legacy(&db, 42, 7).is_none());

        let err = sync.unenroll(Actor::student(42), &key, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "NOT_ENROLLED");
    }

    #[test]
    fn test_disabled_mirror_leaves_legacy_table_alone() {
        let (sync, db) = sync_with(Arc::new(DisabledMirror));
        sync.enroll(Actor::student(42), &EnrollmentKey::new(42, 7), Utc::now()).unwrap();
        assert!(legacy(&db, 42, 7).is_none());
        assert_eq!(sync.mirror_name(), "disabled");
    }

    #[test]
    fn test_reject_then_approve_fails() {
        let (sync, db) = sync_with(Arc::new(SqliteLegacyMirror));
        let request = db
            .write_tx(|tx| records::insert_request(tx, 42, 7, None, Utc::now()))
            .unwrap();

        let review = RequestReview::new(request.id).with_note("prerequisites missing");
        let rejected = sync.reject_request(Actor::admin(1), &review, Utc::now()).unwrap();
        assert_eq!(rejected.data["request"]["status"], "rejected");
        assert_eq!(rejected.data["request"]["review_note"], "prerequisites missing");

        let err = sync
            .approve_request(Actor::admin(1), &RequestReview::new(request.id), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "REQUEST_ALREADY_RESOLVED");
        assert!(db
            .with_conn(|c| records::get_enrollment(c, 42, 7))
            .unwrap()
            .is_none());
    }
}
