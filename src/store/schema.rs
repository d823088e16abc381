//! Database schema.
//!
//! All timestamps are stored as epoch milliseconds.

use rusqlite::Connection;

/// Create all tables and indexes if they do not exist
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            role TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS courses (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            published INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS enrollments (
            user_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            enrolled_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, course_id)
        );

        CREATE TABLE IF NOT EXISTS legacy_progress (
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            total_progress INTEGER NOT NULL DEFAULT 0,
            completed_chapters TEXT NOT NULL DEFAULT '[]',
            watched_videos TEXT NOT NULL DEFAULT '[]',
            quiz_attempts INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER NOT NULL,
            PRIMARY KEY (student_id, course_id)
        );

        CREATE TABLE IF NOT EXISTS access_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            message TEXT,
            requested_at INTEGER NOT NULL,
            reviewed_at INTEGER,
            reviewed_by INTEGER,
            review_note TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_access_requests_pair
            ON access_requests(student_id, course_id, status);

        CREATE TABLE IF NOT EXISTS idempotency_records (
            key TEXT PRIMARY KEY,
            operation TEXT NOT NULL,
            scope TEXT,
            result TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_idempotency_scope ON idempotency_records(scope);
        CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_records(expires_at);

        CREATE TABLE IF NOT EXISTS advisory_locks (
            lock_key INTEGER PRIMARY KEY,
            holder TEXT NOT NULL,
            operation TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn test_enrollment_pair_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = "INSERT INTO enrollments (user_id, course_id, status, progress, enrolled_at, updated_at)
                      VALUES (42, 7, 'active', 0, 0, 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
