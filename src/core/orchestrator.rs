//! Operation orchestrator.
//!
//! Every public operation runs the same state machine:
//!
//! ```text
//! REQUESTED -> LOCK_ACQUIRED -> VALIDATED -> IDEMPOTENT_HIT -> RETURN_CACHED
//!                                         -> EXECUTING -> COMMITTED -> EVENT_EMITTED
//!           (any step)        -> FAILED
//! ```
//!
//! and always ends with exactly one `LOCK_RELEASED`. The trail is returned
//! in `OperationResult.states`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{CourseCatalog, SqliteDirectory, UserDirectory};
use crate::config::EngineSettings;
use crate::domain::{
    AccessRequest, Actor, Enrollment, EnrollmentKey, LegacyProgressRecord, NewAccessRequest,
    OperationResult, OperationState, ProgressUpdate, RequestReview,
};
use crate::store::{records, Database};

use super::error::EngineError;
use super::events::EventBus;
use super::idempotency::{generate_key, IdempotencyStore};
use super::lock::{LockId, LockManager};
use super::sync::{DisabledMirror, LegacyMirror, Mutation, SqliteLegacyMirror, Synchronizer};
use super::validation::{IssueCode, ValidationResult, Validators};

pub const OP_ENROLL: &str = "enroll_student";
pub const OP_UNENROLL: &str = "unenroll_student";
pub const OP_PROGRESS: &str = "update_progress";
pub const OP_CREATE_REQUEST: &str = "create_request";
pub const OP_APPROVE: &str = "approve_request";
pub const OP_REJECT: &str = "reject_request";

/// Lock namespace for a (student, course) pair
const ENROLLMENT_LOCK: &str = "enrollment";

/// Lock namespace for a single access request
const REQUEST_LOCK: &str = "access_request";

/// Counts removed by `purge_expired`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub idempotency_records: usize,
    pub stale_locks: usize,
}

/// State trail of one invocation
struct Trail {
    operation: &'static str,
    id: Uuid,
    states: Vec<OperationState>,
}

impl Trail {
    fn start(operation: &'static str) -> Self {
        let id = Uuid::new_v4();
        debug!(operation, operation_id = %id, "REQUESTED");
        Self {
            operation,
            id,
            states: vec![OperationState::Requested],
        }
    }

    fn push(&mut self, state: OperationState) {
        debug!(operation = self.operation, operation_id = %self.id, state = ?state, "State transition");
        self.states.push(state);
    }
}

/// Where an operation's idempotency record lives and what it supersedes
struct Fingerprint {
    key: String,

    /// Scope the record is stored under
    scope: String,

    /// Extra scopes whose older records this operation supersedes
    supersedes: Vec<String>,
}

impl Fingerprint {
    fn new(operation: &str, params: &[(&str, String)], scope: String) -> Self {
        Self {
            key: generate_key(operation, params),
            scope,
            supersedes: Vec::new(),
        }
    }

    fn superseding(mut self, scope: String) -> Self {
        self.supersedes.push(scope);
        self
    }
}

/// Locks taken by one invocation.
///
/// Released in reverse order by `release_all`, or on drop when the
/// operation unwinds or its future is dropped mid-flight.
struct HeldLocks<'a> {
    locks: &'a LockManager,
    held: Vec<LockId>,
}

impl<'a> HeldLocks<'a> {
    fn new(locks: &'a LockManager) -> Self {
        Self {
            locks,
            held: Vec::new(),
        }
    }

    fn push(&mut self, lock_id: LockId) {
        self.held.push(lock_id);
    }

    fn release_all(&mut self) {
        while let Some(lock_id) = self.held.pop() {
            self.locks.release(&lock_id);
        }
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(count = self.held.len(), "Releasing locks of an interrupted operation");
            self.release_all();
        }
    }
}

/// Successful end of the guarded section
struct Completed {
    data: serde_json::Value,
    was_duplicate: bool,
}

/// Coordinates locks, validation, idempotency, synchronization, and events
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    settings: EngineSettings,
    locks: LockManager,
    idempotency: IdempotencyStore,
    validators: Validators,
    sync: Synchronizer,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    /// Build an engine over `db` with injected directory, catalog, and bus
    pub fn new(
        db: Database,
        settings: EngineSettings,
        users: Arc<dyn UserDirectory>,
        courses: Arc<dyn CourseCatalog>,
        bus: Arc<EventBus>,
    ) -> Self {
        let mirror: Arc<dyn LegacyMirror> = if settings.legacy_mirror {
            Arc::new(SqliteLegacyMirror)
        } else {
            Arc::new(DisabledMirror)
        };

        info!(
            mirror = mirror.name(),
            directory = users.name(),
            failure_policy = ?settings.failure_policy,
            "Enrollment engine ready"
        );

        Self {
            locks: LockManager::new(
                db.clone(),
                settings.lock_lease(),
                settings.lock_poll_interval(),
                settings.failure_policy,
            ),
            idempotency: IdempotencyStore::new(db.clone(), settings.failure_policy),
            validators: Validators::new(db.clone(), users, courses),
            sync: Synchronizer::new(db.clone(), mirror),
            db,
            settings,
            bus,
        }
    }

    /// Engine whose users and courses come from the database's own tables
    pub fn with_local_directory(db: Database, settings: EngineSettings, bus: Arc<EventBus>) -> Self {
        let directory = Arc::new(SqliteDirectory::new(db.clone()));
        Self::new(db, settings, directory.clone(), directory, bus)
    }

    /// Replace the legacy mirror chosen from settings
    pub fn with_legacy_mirror(mut self, mirror: Arc<dyn LegacyMirror>) -> Self {
        info!(mirror = mirror.name(), "Legacy mirror replaced");
        self.sync = Synchronizer::new(self.db.clone(), mirror);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Enroll a student. Enrolling an already-enrolled student succeeds
    /// without changes and reports `was_duplicate`.
    #[instrument(skip(self), fields(student_id = key.student_id, course_id = key.course_id))]
    pub async fn enroll_student(&self, actor: Actor, key: EnrollmentKey) -> OperationResult {
        let mut trail = Trail::start(OP_ENROLL);
        let mut held = HeldLocks::new(&self.locks);

        let outcome: Result<Completed, EngineError> = async {
            self.lock(&mut trail, &mut held, ENROLLMENT_LOCK, key.lock_params()).await?;
            let validation = self.validators.validate_enroll(&actor, &key).await?;
            let fingerprint = Fingerprint::new(OP_ENROLL, &pair_params(&key), key.scope());

            if validation.fails_only_with(IssueCode::AlreadyEnrolled) {
                return self.already_enrolled(&mut trail, &fingerprint, &key);
            }

            self.complete(&mut trail, &fingerprint, &validation, || {
                self.sync.enroll(actor, &key, Utc::now())
            })
        }
        .await;

        self.finish(trail, held, outcome)
    }

    /// Cancel an active enrollment
    #[instrument(skip(self), fields(student_id = key.student_id, course_id = key.course_id))]
    pub async fn unenroll_student(&self, actor: Actor, key: EnrollmentKey) -> OperationResult {
        let mut trail = Trail::start(OP_UNENROLL);
        let mut held = HeldLocks::new(&self.locks);

        let outcome: Result<Completed, EngineError> = async {
            self.lock(&mut trail, &mut held, ENROLLMENT_LOCK, key.lock_params()).await?;
            let validation = self.validators.validate_unenroll(&actor, &key).await?;
            let fingerprint = Fingerprint::new(OP_UNENROLL, &pair_params(&key), key.scope());

            self.complete(&mut trail, &fingerprint, &validation, || {
                self.sync.unenroll(actor, &key, Utc::now())
            })
        }
        .await;

        self.finish(trail, held, outcome)
    }

    /// Merge a progress report into the enrollment and its legacy mirror
    #[instrument(
        skip(self, update),
        fields(student_id = update.student_id, course_id = update.course_id, progress = update.progress)
    )]
    pub async fn update_progress(&self, actor: Actor, update: ProgressUpdate) -> OperationResult {
        let mut trail = Trail::start(OP_PROGRESS);
        let mut held = HeldLocks::new(&self.locks);
        let key = update.key();

        let outcome: Result<Completed, EngineError> = async {
            self.lock(&mut trail, &mut held, ENROLLMENT_LOCK, key.lock_params()).await?;
            let validation = self.validators.validate_progress(&actor, &update).await?;

            let mut params = pair_params(&key);
            params.push(("progress", update.progress.to_string()));
            params.push(("timestamp", update.timestamp.timestamp_millis().to_string()));
            params.push(("completed_chapters", update.completed_chapters.join(",")));
            params.push(("watched_videos", update.watched_videos.join(",")));
            if let Some(attempts) = update.quiz_attempts {
                params.push(("quiz_attempts", attempts.to_string()));
            }
            let fingerprint = Fingerprint::new(OP_PROGRESS, &params, key.scope());

            self.complete(&mut trail, &fingerprint, &validation, || {
                self.sync.update_progress(actor, &update)
            })
        }
        .await;

        self.finish(trail, held, outcome)
    }

    /// File a pending access request for a course
    #[instrument(skip(self, request), fields(student_id = request.student_id, course_id = request.course_id))]
    pub async fn create_request(&self, actor: Actor, request: NewAccessRequest) -> OperationResult {
        let mut trail = Trail::start(OP_CREATE_REQUEST);
        let mut held = HeldLocks::new(&self.locks);
        let key = request.key();

        let outcome: Result<Completed, EngineError> = async {
            self.lock(&mut trail, &mut held, ENROLLMENT_LOCK, key.lock_params()).await?;
            let validation = self.validators.validate_create_request(&actor, &request).await?;

            let mut params = pair_params(&key);
            params.push(("message", request.message.clone().unwrap_or_default()));
            let fingerprint = Fingerprint::new(OP_CREATE_REQUEST, &params, key.scope());

            self.complete(&mut trail, &fingerprint, &validation, || {
                self.sync.create_request(actor, &request, Utc::now())
            })
        }
        .await;

        self.finish(trail, held, outcome)
    }

    /// Approve a pending request, enrolling the student
    #[instrument(skip(self, review), fields(request_id = review.request_id, reviewer = actor.user_id))]
    pub async fn approve_request(&self, actor: Actor, review: RequestReview) -> OperationResult {
        self.review(OP_APPROVE, actor, review).await
    }

    /// Reject a pending request
    #[instrument(skip(self, review), fields(request_id = review.request_id, reviewer = actor.user_id))]
    pub async fn reject_request(&self, actor: Actor, review: RequestReview) -> OperationResult {
        self.review(OP_REJECT, actor, review).await
    }

    /// Canonical enrollment for a pair
    pub fn enrollment(&self, student_id: i64, course_id: i64) -> Result<Option<Enrollment>, EngineError> {
        Ok(self
            .db
            .with_conn(|conn| records::get_enrollment(conn, student_id, course_id))?)
    }

    /// Legacy progress mirror row for a pair
    pub fn legacy_progress(
        &self,
        student_id: i64,
        course_id: i64,
    ) -> Result<Option<LegacyProgressRecord>, EngineError> {
        Ok(self
            .db
            .with_conn(|conn| records::get_legacy_progress(conn, student_id, course_id))?)
    }

    pub fn access_request(&self, request_id: i64) -> Result<Option<AccessRequest>, EngineError> {
        Ok(self.db.with_conn(|conn| records::get_request(conn, request_id))?)
    }

    /// Remove expired idempotency records and abandoned lock rows
    pub fn purge_expired(&self) -> Result<PurgeReport, EngineError> {
        let report = PurgeReport {
            idempotency_records: self.idempotency.purge_expired()?,
            stale_locks: self.locks.purge_stale()?,
        };
        info!(
            idempotency_records = report.idempotency_records,
            stale_locks = report.stale_locks,
            "Purged expired engine state"
        );
        Ok(report)
    }

    async fn review(&self, operation: &'static str, actor: Actor, review: RequestReview) -> OperationResult {
        let approving = operation == OP_APPROVE;
        let mut trail = Trail::start(operation);
        let mut held = HeldLocks::new(&self.locks);

        let outcome: Result<Completed, EngineError> = async {
            let request_id = review.request_id;
            let request_scope = format!("access_request:{}", request_id);

            // Request first, then its pair: the fixed order rules out deadlock
            self.lock(&mut trail, &mut held, REQUEST_LOCK, vec![request_id.to_string()])
                .await?;
            let pair = self
                .access_request(request_id)?
                .map(|r| EnrollmentKey::new(r.student_id, r.course_id));
            if let Some(pair) = pair {
                self.lock(&mut trail, &mut held, ENROLLMENT_LOCK, pair.lock_params()).await?;
            }

            let validation = self
                .validators
                .validate_review(&actor, request_id, approving)
                .await?;

            let params = [
                ("request_id", request_id.to_string()),
                ("reviewer", actor.user_id.to_string()),
            ];
            let mut fingerprint = Fingerprint::new(operation, &params, request_scope);
            if let Some(pair) = pair {
                fingerprint = fingerprint.superseding(pair.scope());
            }

            self.complete(&mut trail, &fingerprint, &validation, || {
                if approving {
                    self.sync.approve_request(actor, &review, Utc::now())
                } else {
                    self.sync.reject_request(actor, &review, Utc::now())
                }
            })
        }
        .await;

        self.finish(trail, held, outcome)
    }

    /// Acquire one lock into `held`, recording LOCK_ACQUIRED once
    async fn lock(
        &self,
        trail: &mut Trail,
        held: &mut HeldLocks<'_>,
        operation: &str,
        params: Vec<String>,
    ) -> Result<(), EngineError> {
        let acquisition = self
            .locks
            .acquire(operation, &params, self.settings.lock_timeout())
            .await?;

        match acquisition.lock_id {
            Some(lock_id) if acquisition.acquired => {
                held.push(lock_id);
                if !trail.states.contains(&OperationState::LockAcquired) {
                    trail.push(OperationState::LockAcquired);
                }
                Ok(())
            }
            _ => Err(EngineError::LockContention {
                operation: format!("{}:{}", operation, params.join(":")),
                waited_ms: acquisition.waited.as_millis() as u64,
            }),
        }
    }

    /// Validated section shared by all operations: replay or execute, then
    /// record the result and publish events
    fn complete<X>(
        &self,
        trail: &mut Trail,
        fingerprint: &Fingerprint,
        validation: &ValidationResult,
        execute: X,
    ) -> Result<Completed, EngineError>
    where
        X: FnOnce() -> Result<Mutation, EngineError>,
    {
        let cached = self
            .idempotency
            .check(&fingerprint.key, trail.operation)?
            .existing_result;

        if !validation.valid {
            // Only a target state this fingerprint already produced is a
            // replay; an unacceptable caller or reference never is
            return match cached {
                Some(data) if validation.fails_only_on_settled_state() => {
                    Ok(self.replay(trail, data))
                }
                _ => Err(EngineError::from_validation(validation)),
            };
        }
        trail.push(OperationState::Validated);

        if let Some(data) = cached {
            return Ok(self.replay_validated(trail, data));
        }

        trail.push(OperationState::Executing);
        let mutation = execute()?;
        trail.push(OperationState::Committed);

        self.record(trail.operation, fingerprint, &mutation.data);

        for event in &mutation.events {
            let report = self.bus.emit(event);
            debug!(
                event_type = ?event.event_type,
                delivered = report.delivered,
                failed = report.failed,
                "Event emitted"
            );
        }
        trail.push(OperationState::EventEmitted);

        Ok(Completed {
            data: mutation.data,
            was_duplicate: false,
        })
    }

    /// Enroll when the pair is already active: replay or no-op success
    fn already_enrolled(
        &self,
        trail: &mut Trail,
        fingerprint: &Fingerprint,
        key: &EnrollmentKey,
    ) -> Result<Completed, EngineError> {
        let cached = self
            .idempotency
            .check(&fingerprint.key, trail.operation)?
            .existing_result;
        if let Some(data) = cached {
            return Ok(self.replay(trail, data));
        }

        let enrollment = self.enrollment(key.student_id, key.course_id)?;
        debug!(student_id = key.student_id, course_id = key.course_id, "Already enrolled, nothing to do");
        Ok(self.replay(
            trail,
            json!({ "enrollment": enrollment, "changed": false }),
        ))
    }

    fn replay(&self, trail: &mut Trail, data: serde_json::Value) -> Completed {
        trail.push(OperationState::Validated);
        self.replay_validated(trail, data)
    }

    fn replay_validated(&self, trail: &mut Trail, data: serde_json::Value) -> Completed {
        trail.push(OperationState::IdempotentHit);
        trail.push(OperationState::ReturnCached);
        Completed {
            data,
            was_duplicate: true,
        }
    }

    /// Store the committed result and drop the records it supersedes.
    /// The mutation is already durable, so failures here are only logged.
    fn record(&self, operation: &str, fingerprint: &Fingerprint, data: &serde_json::Value) {
        if let Err(e) = self.idempotency.store_in_scope(
            &fingerprint.key,
            operation,
            Some(&fingerprint.scope),
            data,
            self.settings.idempotency_ttl(),
        ) {
            warn!(idempotency_key = %fingerprint.key, error = %e, "Failed to record result");
        }

        for scope in std::iter::once(&fingerprint.scope).chain(&fingerprint.supersedes) {
            if let Err(e) = self.idempotency.invalidate_scope(scope, &fingerprint.key) {
                warn!(scope = %scope, error = %e, "Failed to invalidate superseded results");
            }
        }
    }

    /// Release every held lock and build the result
    fn finish(
        &self,
        mut trail: Trail,
        mut held: HeldLocks<'_>,
        outcome: Result<Completed, EngineError>,
    ) -> OperationResult {
        if outcome.is_err() {
            trail.push(OperationState::Failed);
        }

        held.release_all();
        trail.push(OperationState::LockReleased);

        match outcome {
            Ok(completed) => {
                info!(
                    operation = trail.operation,
                    operation_id = %trail.id,
                    duplicate = completed.was_duplicate,
                    "Operation succeeded"
                );
                let result = OperationResult::success(trail.operation, trail.id, completed.data);
                let result = if completed.was_duplicate {
                    result.duplicate()
                } else {
                    result
                };
                result.with_states(trail.states)
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(operation = trail.operation, operation_id = %trail.id, code = e.code(), error = %e, "Operation failed");
                } else {
                    info!(operation = trail.operation, operation_id = %trail.id, code = e.code(), error = %e, "Operation rejected");
                }
                OperationResult::failure(trail.operation, trail.id, e.to_operation_error())
                    .with_states(trail.states)
            }
        }
    }
}

fn pair_params(key: &EnrollmentKey) -> Vec<(&'static str, String)> {
    vec![
        ("student_id", key.student_id.to_string()),
        ("course_id", key.course_id.to_string()),
    ]
}
