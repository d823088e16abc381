//! Row access for enrollments, legacy progress, access requests and the
//! local directory tables.
//!
//! Functions take a `&Connection` so they can run either directly or inside
//! a transaction (`Transaction` derefs to `Connection`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_millis, to_millis, StoreError};
use crate::domain::{
    AccessRequest, CourseInfo, Enrollment, EnrollmentStatus, LegacyProgressRecord,
    RequestStatus, UserProfile, UserRole,
};

// ============================================================================
// Enrollments
// ============================================================================

type EnrollmentRow = (i64, i64, String, i64, i64, i64);

fn enrollment_from_row(row: EnrollmentRow) -> Result<Enrollment, StoreError> {
    let (user_id, course_id, status, progress, enrolled_at, updated_at) = row;
    Ok(Enrollment {
        user_id,
        course_id,
        status: status.parse().map_err(StoreError::Corrupt)?,
        progress: clamp_progress(progress),
        enrolled_at: from_millis(enrolled_at)?,
        updated_at: from_millis(updated_at)?,
    })
}

/// Fetch the enrollment for a (user, course) pair, in any status
pub fn get_enrollment(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
) -> Result<Option<Enrollment>, StoreError> {
    let row: Option<EnrollmentRow> = conn
        .query_row(
            "SELECT user_id, course_id, status, progress, enrolled_at, updated_at
             FROM enrollments WHERE user_id = ?1 AND course_id = ?2",
            params![user_id, course_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    row.map(enrollment_from_row).transpose()
}

/// Insert an active enrollment or reactivate an existing row
pub fn upsert_active_enrollment(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
    progress: u8,
    now: DateTime<Utc>,
) -> Result<Enrollment, StoreError> {
    conn.execute(
        "INSERT INTO enrollments (user_id, course_id, status, progress, enrolled_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(user_id, course_id) DO UPDATE SET
             status = excluded.status,
             progress = excluded.progress,
             enrolled_at = excluded.enrolled_at,
             updated_at = excluded.updated_at",
        params![
            user_id,
            course_id,
            EnrollmentStatus::Active.as_str(),
            progress as i64,
            to_millis(now)
        ],
    )?;

    get_enrollment(conn, user_id, course_id)?
        .ok_or_else(|| StoreError::Corrupt("enrollment missing after upsert".to_string()))
}

/// Change the status of an enrollment. Returns the number of rows changed.
pub fn set_enrollment_status(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
    status: EnrollmentStatus,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE enrollments SET status = ?3, updated_at = MAX(updated_at, ?4)
         WHERE user_id = ?1 AND course_id = ?2",
        params![user_id, course_id, status.as_str(), to_millis(now)],
    )?;
    Ok(changed)
}

/// Overwrite progress and activity time of an enrollment
pub fn write_enrollment_progress(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
    progress: u8,
    updated_at: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE enrollments SET progress = ?3, updated_at = ?4
         WHERE user_id = ?1 AND course_id = ?2",
        params![user_id, course_id, progress as i64, to_millis(updated_at)],
    )?;
    Ok(changed)
}

// ============================================================================
// Legacy progress mirror
// ============================================================================

type LegacyRow = (i64, i64, i64, String, String, i64, i64);

fn legacy_from_row(row: LegacyRow) -> Result<LegacyProgressRecord, StoreError> {
    let (student_id, course_id, total, chapters, videos, attempts, last_accessed) = row;
    Ok(LegacyProgressRecord {
        student_id,
        course_id,
        total_progress: clamp_progress(total),
        completed_chapters: serde_json::from_str(&chapters)?,
        watched_videos: serde_json::from_str(&videos)?,
        quiz_attempts: attempts.max(0) as u32,
        last_accessed: from_millis(last_accessed)?,
    })
}

pub fn get_legacy_progress(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
) -> Result<Option<LegacyProgressRecord>, StoreError> {
    let row: Option<LegacyRow> = conn
        .query_row(
            "SELECT student_id, course_id, total_progress, completed_chapters,
                    watched_videos, quiz_attempts, last_accessed
             FROM legacy_progress WHERE student_id = ?1 AND course_id = ?2",
            params![student_id, course_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    row.map(legacy_from_row).transpose()
}

pub fn upsert_legacy_progress(
    conn: &Connection,
    record: &LegacyProgressRecord,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO legacy_progress (student_id, course_id, total_progress, completed_chapters,
                                      watched_videos, quiz_attempts, last_accessed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(student_id, course_id) DO UPDATE SET
             total_progress = excluded.total_progress,
             completed_chapters = excluded.completed_chapters,
             watched_videos = excluded.watched_videos,
             quiz_attempts = excluded.quiz_attempts,
             last_accessed = excluded.last_accessed",
        params![
            record.student_id,
            record.course_id,
            record.total_progress as i64,
            serde_json::to_string(&record.completed_chapters)?,
            serde_json::to_string(&record.watched_videos)?,
            record.quiz_attempts as i64,
            to_millis(record.last_accessed)
        ],
    )?;
    Ok(())
}

pub fn delete_legacy_progress(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM legacy_progress WHERE student_id = ?1 AND course_id = ?2",
        params![student_id, course_id],
    )?;
    Ok(deleted)
}

// ============================================================================
// Access requests
// ============================================================================

type RequestRow = (
    i64,
    i64,
    i64,
    String,
    Option<String>,
    i64,
    Option<i64>,
    Option<i64>,
    Option<String>,
);

const REQUEST_COLUMNS: &str = "id, student_id, course_id, status, message, requested_at,
                               reviewed_at, reviewed_by, review_note";

fn map_request_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn request_from_row(row: RequestRow) -> Result<AccessRequest, StoreError> {
    let (id, student_id, course_id, status, message, requested_at, reviewed_at, reviewed_by, note) =
        row;
    Ok(AccessRequest {
        id,
        student_id,
        course_id,
        status: status.parse().map_err(StoreError::Corrupt)?,
        message,
        requested_at: from_millis(requested_at)?,
        reviewed_at: reviewed_at.map(from_millis).transpose()?,
        reviewed_by,
        review_note: note,
    })
}

pub fn get_request(conn: &Connection, id: i64) -> Result<Option<AccessRequest>, StoreError> {
    let sql = format!("SELECT {} FROM access_requests WHERE id = ?1", REQUEST_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], map_request_row)
        .optional()?;
    row.map(request_from_row).transpose()
}

/// The pending request for a pair, if any
pub fn pending_request_for(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
) -> Result<Option<AccessRequest>, StoreError> {
    let sql = format!(
        "SELECT {} FROM access_requests
         WHERE student_id = ?1 AND course_id = ?2 AND status = ?3
         ORDER BY id LIMIT 1",
        REQUEST_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![student_id, course_id, RequestStatus::Pending.as_str()],
            map_request_row,
        )
        .optional()?;
    row.map(request_from_row).transpose()
}

pub fn insert_request(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AccessRequest, StoreError> {
    conn.execute(
        "INSERT INTO access_requests (student_id, course_id, status, message, requested_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            student_id,
            course_id,
            RequestStatus::Pending.as_str(),
            message,
            to_millis(now)
        ],
    )?;
    let id = conn.last_insert_rowid();

    get_request(conn, id)?
        .ok_or_else(|| StoreError::Corrupt("access request missing after insert".to_string()))
}

/// Resolve a request that is still pending. Returns the number of rows changed
/// (0 when the request was already resolved).
pub fn resolve_request(
    conn: &Connection,
    id: i64,
    status: RequestStatus,
    reviewed_by: i64,
    review_note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE access_requests
         SET status = ?2, reviewed_at = ?3, reviewed_by = ?4, review_note = ?5
         WHERE id = ?1 AND status = ?6",
        params![
            id,
            status.as_str(),
            to_millis(now),
            reviewed_by,
            review_note,
            RequestStatus::Pending.as_str()
        ],
    )?;
    Ok(changed)
}

/// Delete every pending request for a pair
pub fn delete_pending_requests(
    conn: &Connection,
    student_id: i64,
    course_id: i64,
) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM access_requests WHERE student_id = ?1 AND course_id = ?2 AND status = ?3",
        params![student_id, course_id, RequestStatus::Pending.as_str()],
    )?;
    Ok(deleted)
}

// ============================================================================
// Directory tables
// ============================================================================

pub fn get_user(conn: &Connection, id: i64) -> Result<Option<UserProfile>, StoreError> {
    let row: Option<(i64, String, bool)> = conn
        .query_row(
            "SELECT id, role, active FROM users WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(id, role, active)| {
        Ok(UserProfile {
            id,
            role: role.parse::<UserRole>().map_err(StoreError::Corrupt)?,
            active,
        })
    })
    .transpose()
}

pub fn upsert_user(conn: &Connection, user: &UserProfile) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO users (id, role, active) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET role = excluded.role, active = excluded.active",
        params![user.id, user.role.as_str(), user.active],
    )?;
    Ok(())
}

pub fn get_course(conn: &Connection, id: i64) -> Result<Option<CourseInfo>, StoreError> {
    let course = conn
        .query_row(
            "SELECT id, title, published FROM courses WHERE id = ?1",
            params![id],
            |row| {
                Ok(CourseInfo {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    published: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(course)
}

pub fn upsert_course(conn: &Connection, course: &CourseInfo) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO courses (id, title, published) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, published = excluded.published",
        params![course.id, course.title, course.published],
    )?;
    Ok(())
}

fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[test]
    fn test_enrollment_upsert_reactivates() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        db.write_tx(|tx| {
            upsert_active_enrollment(tx, 42, 7, 30, now)?;
            set_enrollment_status(tx, 42, 7, EnrollmentStatus::Cancelled, now)?;
            Ok(())
        })
        .unwrap();

        let cancelled = db.with_conn(|c| get_enrollment(c, 42, 7)).unwrap().unwrap();
        assert_eq!(cancelled.status, EnrollmentStatus::Cancelled);

        let reactivated = db
            .write_tx(|tx| upsert_active_enrollment(tx, 42, 7, 0, now))
            .unwrap();
        assert!(reactivated.is_active());
        assert_eq!(reactivated.progress, 0);
    }

    #[test]
    fn test_legacy_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let record = LegacyProgressRecord {
            student_id: 5,
            course_id: 3,
            total_progress: 40,
            completed_chapters: vec!["ch-1".to_string()],
            watched_videos: vec!["v-1".to_string(), "v-2".to_string()],
            quiz_attempts: 2,
            last_accessed: Utc::now(),
        };

        db.write_tx(|tx| upsert_legacy_progress(tx, &record)).unwrap();
        let loaded = db
            .with_conn(|c| get_legacy_progress(c, 5, 3))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.total_progress, 40);
        assert_eq!(loaded.watched_videos.len(), 2);
        assert_eq!(loaded.quiz_attempts, 2);

        let deleted = db.write_tx(|tx| delete_legacy_progress(tx, 5, 3)).unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_resolve_only_pending_requests() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let request = db
            .write_tx(|tx| insert_request(tx, 42, 7, Some("please"), now))
            .unwrap();
        assert!(request.is_pending());

        let first = db
            .write_tx(|tx| resolve_request(tx, request.id, RequestStatus::Approved, 1, None, now))
            .unwrap();
        let second = db
            .write_tx(|tx| resolve_request(tx, request.id, RequestStatus::Rejected, 1, None, now))
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let stored = db.with_conn(|c| get_request(c, request.id)).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(stored.reviewed_by, Some(1));
    }
}
