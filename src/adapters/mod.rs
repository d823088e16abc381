//! Adapter interfaces for external systems.
//!
//! The engine trusts the identity provider for the caller's identity, but
//! still looks up *referenced* users and courses through these traits.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{CourseInfo, UserProfile};

// Re-export the SQLite-backed directory
pub use sqlite::SqliteDirectory;

/// Lookup of users known to the identity provider
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Find a user by id
    async fn find_user(&self, user_id: i64) -> Result<Option<UserProfile>>;
}

/// Lookup of courses in the course catalog
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Find a course by id
    async fn find_course(&self, course_id: i64) -> Result<Option<CourseInfo>>;
}
