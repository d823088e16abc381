//! SQLite relational store.
//!
//! A single `Database` handle wraps one connection. Independent handles
//! opened on the same file behave like independent processes: they share
//! tables, transactions, and the advisory-lock table, and nothing else.
//!
//! ## Tables
//!
//! - `enrollments` - canonical enrollments, unique on (user_id, course_id)
//! - `legacy_progress` - legacy progress mirror, unique on (student_id, course_id)
//! - `access_requests` - course access requests
//! - `idempotency_records` - completed-operation cache with TTL
//! - `advisory_locks` - cooperative integer-keyed locks with a lease
//! - `users`, `courses` - local copy of directory/catalog data

pub mod records;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the relational store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database busy")]
    Busy,

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the error is transient contention (busy/locked database)
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the error is a uniqueness/constraint violation
    pub fn is_constraint(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

/// Handle to the backing SQLite database
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    busy_timeout: Duration,
}

/// rusqlite's own default for new connections
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl Database {
    /// Open or create a database file and initialize its schema
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        info!("Opening SQLite database at {:?}", path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            busy_timeout,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Path of the database file (None for in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.lock_conn();
        f(&conn)
    }

    /// A panic inside a transaction poisons the mutex, but the open
    /// transaction is rolled back when it unwinds, so the connection stays
    /// usable.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering connection after a panic in a previous holder");
            poisoned.into_inner()
        })
    }

    /// Run a closure inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so two writers never both read
    /// stale state and then race to commit. Returning `Err` rolls back.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock_conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(StoreError::from(e)))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| E::from(StoreError::from(e)))?;
        Ok(value)
    }

    /// `transact` specialised to store errors
    pub fn write_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        self.transact(f)
    }

    /// `write_tx` that waits at most `max_wait` for the connection and the
    /// database write lock. Contention on either is `StoreError::Busy` or a
    /// SQLite busy error, both reported by `is_busy`.
    pub fn try_write_tx<T, F>(&self, max_wait: Duration, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = match self.conn.try_lock() {
            Ok(conn) => conn,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(StoreError::Busy),
        };

        conn.busy_timeout(max_wait.min(self.busy_timeout))?;
        let result = immediate_tx(&mut conn, f);

        if let Err(e) = conn.busy_timeout(self.busy_timeout) {
            warn!(error = %e, "Failed to restore busy timeout");
        }
        result
    }
}

fn immediate_tx<T, F>(conn: &mut Connection, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Convert a timestamp to its stored representation (epoch millis)
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored epoch-millis value back to a timestamp
pub fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp: {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .unwrap();

        for table in [
            "access_requests",
            "advisory_locks",
            "courses",
            "enrollments",
            "idempotency_records",
            "legacy_progress",
            "users",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table {}", table);
        }
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), StoreError> = db.write_tx(|tx| {
            tx.execute(
                "INSERT INTO users (id, role, active) VALUES (1, 'student', 1)",
                [],
            )?;
            Err(StoreError::Corrupt("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_database_shared_between_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.db");

        let first = Database::open(&path, Duration::from_secs(1)).unwrap();
        let second = Database::open(&path, Duration::from_secs(1)).unwrap();

        first
            .write_tx(|tx| {
                tx.execute(
                    "INSERT INTO courses (id, title, published) VALUES (7, 'Rust', 1)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let title: String = second
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT title FROM courses WHERE id = 7", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(title, "Rust");
    }

    #[test]
    fn test_try_write_tx_reports_busy_without_waiting() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("engine.db");
        let first = Database::open(&path, Duration::from_secs(5)).unwrap();
        let second = Database::open(&path, Duration::from_secs(5)).unwrap();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let writer = std::thread::spawn(move || {
            first
                .write_tx(|_tx| {
                    started_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(600));
                    Ok(())
                })
                .unwrap();
        });
        started_rx.recv().unwrap();

        let started = std::time::Instant::now();
        let err = second.try_write_tx(Duration::ZERO, |_tx| Ok(())).unwrap_err();
        assert!(err.is_busy());
        assert!(started.elapsed() < Duration::from_millis(300));

        writer.join().unwrap();
        second.try_write_tx(Duration::ZERO, |_tx| Ok(())).unwrap();
    }

    #[test]
    fn test_connection_survives_panic_in_transaction() {
        let db = Database::open_in_memory().unwrap();

        let panicking = db.clone();
        let outcome = std::thread::spawn(move || {
            let _: Result<(), StoreError> = panicking.write_tx(|tx| {
                tx.execute("INSERT INTO users (id, role, active) VALUES (1, 'student', 1)", [])?;
                panic!("handler blew up");
            });
        })
        .join();
        assert!(outcome.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let restored = from_millis(to_millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }
}
