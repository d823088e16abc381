//! Keyed mutual exclusion on top of the store's advisory-lock table.
//!
//! A lock key is a deterministic 64-bit hash of the operation name and its
//! ordered parameters, so every process sharing the database derives the
//! same key for the same logical resource.
//!
//! The acquisition `timeout` bounds only how long a caller waits. Once
//! acquired, a lock is held until `release` is called. Each row carries a
//! lease, and other acquirers may reclaim a row whose lease has passed. That
//! lease is a crash backstop, not a hold limit: nothing ever releases a
//! live holder's lock on a timer.

use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::params;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::EngineError;
use crate::config::FailurePolicy;
use crate::store::{to_millis, Database, StoreError};

/// Identifies one successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockId {
    /// Advisory-lock key
    pub key: i64,

    /// Operation name the key was derived from
    pub operation: String,

    /// Unique token of this acquisition
    pub holder: Uuid,

    /// True when the lock subsystem failed and the caller proceeds unlocked
    pub degraded: bool,
}

/// Result of an acquisition attempt
#[derive(Debug, Clone)]
pub struct LockAcquisition {
    pub acquired: bool,
    pub lock_id: Option<LockId>,

    /// How long the caller waited
    pub waited: Duration,
}

/// Advisory lock manager
#[derive(Debug, Clone)]
pub struct LockManager {
    db: Database,
    lease: Duration,
    poll_interval: Duration,
    policy: FailurePolicy,
}

impl LockManager {
    pub fn new(db: Database, lease: Duration, poll_interval: Duration, policy: FailurePolicy) -> Self {
        Self {
            db,
            lease,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            policy,
        }
    }

    /// Acquire the lock for `(operation, params)`.
    ///
    /// `timeout == 0` is a single non-blocking try. Otherwise the call polls
    /// with bounded backoff until the lock is free or `timeout` elapses.
    /// `Err` is only returned under the fail-closed policy.
    pub async fn acquire(
        &self,
        operation: &str,
        params: &[String],
        timeout: Duration,
    ) -> Result<LockAcquisition, EngineError> {
        let key = lock_key(operation, params);
        let holder = Uuid::new_v4();
        let started = Instant::now();
        let mut delay = self.poll_interval;

        loop {
            // A busy database is contention like a held lock, not a failure.
            // Each attempt waits on SQLite for at most one poll step so the
            // caller's timeout stays the bound.
            let max_wait = timeout.saturating_sub(started.elapsed()).min(self.poll_interval);
            let attempt = match self.try_insert(key, holder, operation, max_wait) {
                Err(e) if e.is_busy() => Ok(false),
                other => other,
            };

            match attempt {
                Ok(true) => {
                    debug!(operation, lock_key = key, %holder, "Lock acquired");
                    return Ok(LockAcquisition {
                        acquired: true,
                        lock_id: Some(LockId {
                            key,
                            operation: operation.to_string(),
                            holder,
                            degraded: false,
                        }),
                        waited: started.elapsed(),
                    });
                }
                Ok(false) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        debug!(operation, lock_key = key, waited_ms = waited.as_millis() as u64, "Lock busy");
                        return Ok(LockAcquisition {
                            acquired: false,
                            lock_id: None,
                            waited,
                        });
                    }
                    tokio::time::sleep(delay.min(timeout - waited)).await;
                    delay = (delay * 2).min(self.poll_interval * 8);
                }
                Err(e) => return self.on_lock_failure(operation, key, started, e),
            }
        }
    }

    /// Release a lock. Idempotent and best-effort: failures are logged and
    /// never returned. Only the row owned by this acquisition is removed.
    pub fn release(&self, lock: &LockId) {
        if lock.degraded {
            return;
        }

        let result = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM advisory_locks WHERE lock_key = ?1 AND holder = ?2",
                params![lock.key, lock.holder.to_string()],
            )?)
        });

        match result {
            Ok(0) => debug!(lock_key = lock.key, "Lock already released"),
            Ok(_) => debug!(lock_key = lock.key, operation = %lock.operation, "Lock released"),
            Err(e) => warn!(lock_key = lock.key, error = %e, "Failed to release lock; lease will expire"),
        }
    }

    /// Whether a live (unexpired) lock is held for `(operation, params)`
    pub fn is_locked(&self, operation: &str, params: &[String]) -> Result<bool, StoreError> {
        let key = lock_key(operation, params);
        let now = to_millis(Utc::now());
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM advisory_locks WHERE lock_key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Remove lock rows whose lease has passed. Returns the number removed.
    pub fn purge_stale(&self) -> Result<usize, StoreError> {
        let now = to_millis(Utc::now());
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM advisory_locks WHERE expires_at <= ?1",
                params![now],
            )?)
        })
    }

    /// One attempt: reclaim an expired row for the key, then insert if free
    fn try_insert(
        &self,
        key: i64,
        holder: Uuid,
        operation: &str,
        max_wait: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let expires = now + lease;

        self.db.try_write_tx(max_wait, |tx| {
            let reclaimed = tx.execute(
                "DELETE FROM advisory_locks WHERE lock_key = ?1 AND expires_at <= ?2",
                params![key, to_millis(now)],
            )?;
            if reclaimed > 0 {
                warn!(operation, lock_key = key, "Reclaimed lock with expired lease");
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO advisory_locks (lock_key, holder, operation, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![key, holder.to_string(), operation, to_millis(now), to_millis(expires)],
            )?;
            Ok(inserted == 1)
        })
    }

    fn on_lock_failure(
        &self,
        operation: &str,
        key: i64,
        started: Instant,
        error: StoreError,
    ) -> Result<LockAcquisition, EngineError> {
        match self.policy {
            FailurePolicy::FailOpen => {
                warn!(
                    operation,
                    lock_key = key,
                    error = %error,
                    "Lock subsystem unavailable, proceeding without exclusion"
                );
                Ok(LockAcquisition {
                    acquired: true,
                    lock_id: Some(LockId {
                        key,
                        operation: operation.to_string(),
                        holder: Uuid::new_v4(),
                        degraded: true,
                    }),
                    waited: started.elapsed(),
                })
            }
            FailurePolicy::FailClosed => Err(EngineError::Infrastructure(format!(
                "lock subsystem unavailable: {}",
                error
            ))),
        }
    }
}

/// Derive the advisory-lock key for an operation and its ordered parameters.
///
/// First 8 bytes of SHA-256 over `operation|p1|p2...`, read as a signed
/// big-endian integer.
pub fn lock_key(operation: &str, params: &[String]) -> i64 {
    let mut material = String::from(operation);
    for param in params {
        material.push('|');
        material.push_str(param);
    }

    let digest = Sha256::digest(material.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
