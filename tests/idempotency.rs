//! Idempotency Integration Tests
//!
//! Tests for fingerprinting, replay, TTL expiry, and scope invalidation
//! through the public engine API.

use std::sync::Arc;
use std::time::Duration;

use enrollsync::adapters::SqliteDirectory;
use enrollsync::config::{EngineSettings, FailurePolicy};
use enrollsync::core::{generate_key, EngineError, IdempotencyStore, OP_ENROLL};
use enrollsync::domain::{CourseInfo, UserProfile};
use enrollsync::{Actor, Database, EnrollmentKey, EventBus, OperationState, Orchestrator, UserRole};
use serde_json::json;

fn seeded_engine(settings: EngineSettings) -> Orchestrator {
    let db = Database::open_in_memory().unwrap();
    let directory = SqliteDirectory::new(db.clone());
    directory
        .add_user(&UserProfile { id: 42, role: UserRole::Student, active: true })
        .unwrap();
    directory
        .add_course(&CourseInfo { id: 7, title: "Rust".into(), published: true })
        .unwrap();
    Orchestrator::with_local_directory(db, settings, Arc::new(EventBus::new()))
}

#[test]
fn test_key_independent_of_parameter_order() {
    let a = generate_key(
        OP_ENROLL,
        &[("student_id", "42".to_string()), ("course_id", "7".to_string())],
    );
    let b = generate_key(
        OP_ENROLL,
        &[("course_id", "7".to_string()), ("student_id", "42".to_string())],
    );
    assert_eq!(a, b);
    assert!(a.starts_with("enroll_student:"));

    let other = generate_key(
        OP_ENROLL,
        &[("student_id", "42".to_string()), ("course_id", "8".to_string())],
    );
    assert_ne!(a, other);
}

#[tokio::test]
async fn test_execute_with_idempotency_runs_once() {
    let db = Database::open_in_memory().unwrap();
    let store = IdempotencyStore::new(db, FailurePolicy::FailOpen);
    let params = [("invoice", "INV-1".to_string())];
    let mut calls = 0;

    let first = store
        .execute_with_idempotency("charge", &params, Duration::from_secs(60), || {
            calls += 1;
            async { Ok(json!({ "charged": 100 })) }
        })
        .await
        .unwrap();
    assert!(!first.was_duplicate);

    let second = store
        .execute_with_idempotency("charge", &params, Duration::from_secs(60), || {
            calls += 1;
            async { Ok(json!({ "charged": 999 })) }
        })
        .await
        .unwrap();

    assert!(second.was_duplicate);
    assert_eq!(second.result, json!({ "charged": 100 }));
    assert_eq!(calls, 1);
}

#[tokio::test]
async fn test_failed_executor_is_not_recorded() {
    let db = Database::open_in_memory().unwrap();
    let store = IdempotencyStore::new(db, FailurePolicy::FailOpen);
    let params = [("invoice", "INV-2".to_string())];

    let failed = store
        .execute_with_idempotency("charge", &params, Duration::from_secs(60), || async {
            Err(EngineError::Transaction("database is locked".to_string()))
        })
        .await;
    assert!(failed.is_err());

    let retried = store
        .execute_with_idempotency("charge", &params, Duration::from_secs(60), || async {
            Ok(json!({ "charged": 100 }))
        })
        .await
        .unwrap();
    assert!(!retried.was_duplicate);
}

#[tokio::test]
async fn test_replay_after_ttl_re_executes() {
    let db = Database::open_in_memory().unwrap();
    let store = IdempotencyStore::new(db, FailurePolicy::FailOpen);
    let params = [("invoice", "INV-3".to_string())];
    let ttl = Duration::from_millis(20);

    store
        .execute_with_idempotency("charge", &params, ttl, || async { Ok(json!(1)) })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let again = store
        .execute_with_idempotency("charge", &params, ttl, || async { Ok(json!(2)) })
        .await
        .unwrap();
    assert!(!again.was_duplicate);
    assert_eq!(again.result, json!(2));
}

#[tokio::test]
async fn test_enroll_replay_returns_original_result() {
    let engine = seeded_engine(EngineSettings::default());
    let key = EnrollmentKey::new(42, 7);

    let first = engine.enroll_student(Actor::student(42), key).await;
    let replay = engine.enroll_student(Actor::student(42), key).await;

    assert!(first.success);
    assert!(!first.was_duplicate);
    assert!(replay.success);
    assert!(replay.was_duplicate);
    assert_eq!(replay.data, first.data);
    assert_ne!(replay.operation_id, first.operation_id);
    assert!(replay.states.contains(&OperationState::IdempotentHit));
    assert!(!replay.states.contains(&OperationState::Executing));
}

#[tokio::test]
async fn test_enroll_replay_after_expiry_is_noop_success() {
    let settings = EngineSettings {
        idempotency_ttl_hours: 0,
        ..EngineSettings::default()
    };
    let engine = seeded_engine(settings);
    let key = EnrollmentKey::new(42, 7);

    assert!(engine.enroll_student(Actor::student(42), key).await.success);

    // With no live record the already-active enrollment is still a success
    let again = engine.enroll_student(Actor::student(42), key).await;
    assert!(again.success);
    assert!(again.was_duplicate);
    assert_eq!(again.data.as_ref().unwrap()["changed"], false);
    assert_eq!(again.data.as_ref().unwrap()["enrollment"]["status"], "active");
}
