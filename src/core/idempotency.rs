//! Fingerprint-keyed cache of completed operation results.
//!
//! A record is written only after the mutation it protects has committed.
//! Expired records are treated as absent; removing them is left to the
//! periodic `purge_expired` primitive.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::EngineError;
use crate::config::FailurePolicy;
use crate::store::{to_millis, Database, StoreError};

/// Result of looking up an idempotency key
#[derive(Debug, Clone, Default)]
pub struct IdempotencyCheck {
    pub is_duplicate: bool,
    pub existing_result: Option<serde_json::Value>,
}

/// Result of `execute_with_idempotency`
#[derive(Debug, Clone)]
pub struct IdempotentOutcome {
    pub result: serde_json::Value,
    pub was_duplicate: bool,
}

/// SQLite-backed idempotency store
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    db: Database,
    policy: FailurePolicy,
}

impl IdempotencyStore {
    pub fn new(db: Database, policy: FailurePolicy) -> Self {
        Self { db, policy }
    }

    /// Look up an unexpired record for `key` recorded by `operation`
    pub fn check(&self, key: &str, operation: &str) -> Result<IdempotencyCheck, EngineError> {
        let now = to_millis(Utc::now());
        let lookup = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT result FROM idempotency_records
                     WHERE key = ?1 AND operation = ?2 AND expires_at > ?3",
                    params![key, operation, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        });

        match lookup {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(result) => {
                    debug!(idempotency_key = key, operation, "Idempotency hit");
                    Ok(IdempotencyCheck {
                        is_duplicate: true,
                        existing_result: Some(result),
                    })
                }
                Err(e) => {
                    warn!(idempotency_key = key, error = %e, "Unreadable idempotency record, ignoring");
                    Ok(IdempotencyCheck::default())
                }
            },
            Ok(None) => Ok(IdempotencyCheck::default()),
            Err(e) => self.degrade("check", key, e).map(|_| IdempotencyCheck::default()),
        }
    }

    /// Record a completed result with a time-to-live
    pub fn store(
        &self,
        key: &str,
        operation: &str,
        result: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        self.store_in_scope(key, operation, None, result, ttl)
    }

    /// Record a completed result that belongs to a resource scope
    pub fn store_in_scope(
        &self,
        key: &str,
        operation: &str,
        scope: Option<&str>,
        result: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let serialized = serde_json::to_string(result)?;

        let written = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO idempotency_records (key, operation, scope, result, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                     operation = excluded.operation,
                     scope = excluded.scope,
                     result = excluded.result,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at",
                params![
                    key,
                    operation,
                    scope,
                    serialized,
                    to_millis(now),
                    to_millis(now + ttl)
                ],
            )?;
            Ok(())
        });

        match written {
            Ok(()) => Ok(()),
            Err(e) => self.degrade("store", key, e),
        }
    }

    /// Drop every record in `scope` except `keep_key`.
    ///
    /// Called after a mutation commits so that replaying an older operation
    /// on the same resource re-executes against current state.
    pub fn invalidate_scope(&self, scope: &str, keep_key: &str) -> Result<usize, EngineError> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM idempotency_records WHERE scope = ?1 AND key <> ?2",
                params![scope, keep_key],
            )?)
        });

        match removed {
            Ok(n) => {
                if n > 0 {
                    debug!(scope, removed = n, "Invalidated superseded idempotency records");
                }
                Ok(n)
            }
            Err(e) => self.degrade("invalidate", scope, e).map(|_| 0),
        }
    }

    /// Run `executor` at most once per fingerprint within `ttl`
    pub async fn execute_with_idempotency<F, Fut>(
        &self,
        operation: &str,
        params: &[(&str, String)],
        ttl: Duration,
        executor: F,
    ) -> Result<IdempotentOutcome, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EngineError>>,
    {
        let key = generate_key(operation, params);

        let check = self.check(&key, operation)?;
        if let (true, Some(result)) = (check.is_duplicate, check.existing_result) {
            return Ok(IdempotentOutcome {
                result,
                was_duplicate: true,
            });
        }

        let result = executor().await?;
        if let Err(e) = self.store(&key, operation, &result, ttl) {
            // The executor's effect already happened; report it regardless
            warn!(idempotency_key = %key, error = %e, "Failed to record idempotent result");
        }

        Ok(IdempotentOutcome {
            result,
            was_duplicate: false,
        })
    }

    /// Delete expired records. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = to_millis(Utc::now());
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM idempotency_records WHERE expires_at <= ?1",
                params![now],
            )?)
        })
    }

    fn degrade(&self, action: &str, key: &str, error: StoreError) -> Result<(), EngineError> {
        match self.policy {
            FailurePolicy::FailOpen => {
                warn!(
                    action,
                    idempotency_key = key,
                    error = %error,
                    "Idempotency store unavailable, proceeding without deduplication"
                );
                Ok(())
            }
            FailurePolicy::FailClosed => Err(EngineError::Infrastructure(format!(
                "idempotency {} failed: {}",
                action, error
            ))),
        }
    }
}

/// Generate the idempotency key for an operation.
///
/// Parameter names are sorted before hashing, so argument order never
/// changes the fingerprint. Format: `{operation}:{hash32}`.
pub fn generate_key(operation: &str, params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut material = String::from(operation);
    for (name, value) in sorted {
        material.push('|');
        material.push_str(name);
        material.push(':');
        material.push_str(value);
    }

    let digest = Sha256::digest(material.as_bytes());
    format!("{}:{}", operation, hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Database::open_in_memory().unwrap(), FailurePolicy::FailOpen)
    }

    #[test]
    fn test_key_ignores_parameter_order() {
        let a = generate_key("enroll_student", &[("student_id", "42".into()), ("course_id", "7".into())]);
        let b = generate_key("enroll_student", &[("course_id", "7".into()), ("student_id", "42".into())]);
        assert_eq!(a, b);
        assert!(a.starts_with("enroll_student:"));
        assert_eq!(a.len(), "enroll_student:".len() + 32);
    }

    #[test]
    fn test_key_depends_on_values_and_operation() {
        let base = generate_key("enroll_student", &[("student_id", "42".into())]);
        assert_ne!(base, generate_key("enroll_student", &[("student_id", "43".into())]));
        assert_ne!(base, generate_key("unenroll_student", &[("student_id", "42".into())]));
    }

    #[test]
    fn test_check_and_store() {
        let store = store();
        let key = generate_key("update_progress", &[("progress", "40".into())]);

        assert!(!store.check(&key, "update_progress").unwrap().is_duplicate);

        store
            .store(&key, "update_progress", &json!({ "progress": 40 }), Duration::from_secs(60))
            .unwrap();

        let hit = store.check(&key, "update_progress").unwrap();
        assert!(hit.is_duplicate);
        assert_eq!(hit.existing_result.unwrap()["progress"], 40);

        // A record only answers for the operation that wrote it
        assert!(!store.check(&key, "enroll_student").unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn test_expired_record_is_absent() {
        let store = store();
        let key = generate_key("enroll_student", &[("student_id", "1".into())]);

        store
            .store(&key, "enroll_student", &json!({ "ok": true }), Duration::from_millis(20))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.check(&key, "enroll_student").unwrap().is_duplicate);
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_invalidate_scope_keeps_latest() {
        let store = store();
        let ttl = Duration::from_secs(60);

        store
            .store_in_scope("enroll:a", "enroll_student", Some("enrollment:42:7"), &json!(1), ttl)
            .unwrap();
        store
            .store_in_scope("unenroll:b", "unenroll_student", Some("enrollment:42:7"), &json!(2), ttl)
            .unwrap();
        store
            .store_in_scope("enroll:c", "enroll_student", Some("enrollment:42:8"), &json!(3), ttl)
            .unwrap();

        assert_eq!(store.invalidate_scope("enrollment:42:7", "unenroll:b").unwrap(), 1);
        assert!(!store.check("enroll:a", "enroll_student").unwrap().is_duplicate);
        assert!(store.check("unenroll:b", "unenroll_student").unwrap().is_duplicate);
        assert!(store.check("enroll:c", "enroll_student").unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn test_execute_with_idempotency_runs_once() {
        let store = store();
        let params = [("student_id", "5".to_string()), ("course_id", "3".to_string())];
        let mut runs = 0;

        let first = store
            .execute_with_idempotency("grant", &params, Duration::from_secs(60), || {
                runs += 1;
                async { Ok(json!({ "granted": true })) }
            })
            .await
            .unwrap();
        assert!(!first.was_duplicate);

        let second = store
            .execute_with_idempotency("grant", &params, Duration::from_secs(60), || {
                runs += 1;
                async { Ok(json!({ "granted": false })) }
            })
            .await
            .unwrap();
        assert!(second.was_duplicate);
        assert_eq!(second.result["granted"], true);
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_failed_executor_is_not_cached() {
        let store = store();
        let params = [("student_id", "9".to_string())];

        let failed = store
            .execute_with_idempotency("grant", &params, Duration::from_secs(60), || async {
                Err(EngineError::Transaction("busy".to_string()))
            })
            .await;
        assert!(failed.is_err());

        let retried = store
            .execute_with_idempotency("grant", &params, Duration::from_secs(60), || async {
                Ok(json!("done"))
            })
            .await
            .unwrap();
        assert!(!retried.was_duplicate);
    }
}
