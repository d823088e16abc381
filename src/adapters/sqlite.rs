//! Directory and catalog backed by the engine's own SQLite tables.
//!
//! Deployments that keep users and courses elsewhere inject their own
//! `UserDirectory`/`CourseCatalog`; the CLI and tests use this one.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{CourseCatalog, UserDirectory};
use crate::domain::{CourseInfo, UserProfile};
use crate::store::{records, Database};

/// Reads `users` and `courses` from the engine database
#[derive(Debug, Clone)]
pub struct SqliteDirectory {
    db: Database,
}

impl SqliteDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register or update a user
    pub fn add_user(&self, user: &UserProfile) -> Result<()> {
        self.db
            .with_conn(|conn| records::upsert_user(conn, user))
            .with_context(|| format!("Failed to save user {}", user.id))
    }

    /// Register or update a course
    pub fn add_course(&self, course: &CourseInfo) -> Result<()> {
        self.db
            .with_conn(|conn| records::upsert_course(conn, course))
            .with_context(|| format!("Failed to save course {}", course.id))
    }
}

#[async_trait]
impl UserDirectory for SqliteDirectory {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn find_user(&self, user_id: i64) -> Result<Option<UserProfile>> {
        self.db
            .with_conn(|conn| records::get_user(conn, user_id))
            .with_context(|| format!("Failed to look up user {}", user_id))
    }
}

#[async_trait]
impl CourseCatalog for SqliteDirectory {
    async fn find_course(&self, course_id: i64) -> Result<Option<CourseInfo>> {
        self.db
            .with_conn(|conn| records::get_course(conn, course_id))
            .with_context(|| format!("Failed to look up course {}", course_id))
    }
}
