//! Command-line interface for enrollsync.
//!
//! Provides commands for seeding users and courses, running the engine's
//! operations, inspecting enrollments, and purging expired engine state.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;

use crate::adapters::SqliteDirectory;
use crate::config;
use crate::core::{EventBus, EventFilter, Orchestrator};
use crate::domain::{
    Actor, CourseInfo, DomainEvent, EnrollmentKey, OperationResult, ProgressUpdate, UserProfile,
    UserRole,
};
use crate::store::Database;

pub mod request;

/// enrollsync - Enrollment consistency and idempotent operation engine
#[derive(Parser, Debug)]
#[command(name = "enrollsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the engine database
    Init,

    /// Manage local users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage local courses
    Course {
        #[command(subcommand)]
        command: CourseCommands,
    },

    /// Enroll a student in a course
    Enroll {
        student_id: i64,
        course_id: i64,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Cancel a student's enrollment
    Unenroll {
        student_id: i64,
        course_id: i64,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Report course progress
    Progress {
        student_id: i64,
        course_id: i64,

        /// Progress percentage (0-100)
        progress: i32,

        /// When the progress was made (RFC 3339, defaults to now)
        #[arg(long)]
        at: Option<String>,

        /// Completed chapter ids (repeatable)
        #[arg(long = "chapter")]
        chapters: Vec<String>,

        /// Watched video ids (repeatable)
        #[arg(long = "video")]
        videos: Vec<String>,

        /// Quiz attempts so far
        #[arg(long)]
        quiz_attempts: Option<u32>,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Manage course access requests
    Request {
        #[command(subcommand)]
        command: request::RequestCommands,
    },

    /// Show the canonical and legacy rows of an enrollment
    Status { student_id: i64, course_id: i64 },

    /// Purge expired idempotency records and stale locks
    Gc,

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum UserCommands {
    /// Register or update a user
    Add {
        user_id: i64,

        #[arg(short, long, value_enum, default_value = "student")]
        role: RoleArg,

        /// Mark the user inactive
        #[arg(long)]
        inactive: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum CourseCommands {
    /// Register or update a course
    Add {
        course_id: i64,
        title: String,

        /// Keep the course unpublished
        #[arg(long)]
        unpublished: bool,
    },
}

/// Identity of the caller, trusted as given
#[derive(Args, Debug, Clone, Copy)]
pub struct ActorArgs {
    /// Acting user id
    #[arg(long)]
    pub actor: i64,

    /// Acting user role
    #[arg(long, value_enum, default_value = "student")]
    pub role: RoleArg,
}

impl From<ActorArgs> for Actor {
    fn from(args: ActorArgs) -> Self {
        Actor::new(args.actor, args.role.into())
    }
}

/// Role for CLI (maps to UserRole)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Student,
    Instructor,
    Admin,
}

impl From<RoleArg> for UserRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Student => UserRole::Student,
            RoleArg::Instructor => UserRole::Instructor,
            RoleArg::Admin => UserRole::Admin,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init => init(),
            Commands::User { command } => match command {
                UserCommands::Add {
                    user_id,
                    role,
                    inactive,
                } => add_user(user_id, role.into(), !inactive),
            },
            Commands::Course { command } => match command {
                CourseCommands::Add {
                    course_id,
                    title,
                    unpublished,
                } => add_course(course_id, title, !unpublished),
            },
            Commands::Enroll {
                student_id,
                course_id,
                actor,
            } => {
                let engine = open_engine()?;
                let result = engine
                    .enroll_student(actor.into(), EnrollmentKey::new(student_id, course_id))
                    .await;
                print_result(&result)
            }
            Commands::Unenroll {
                student_id,
                course_id,
                actor,
            } => {
                let engine = open_engine()?;
                let result = engine
                    .unenroll_student(actor.into(), EnrollmentKey::new(student_id, course_id))
                    .await;
                print_result(&result)
            }
            Commands::Progress {
                student_id,
                course_id,
                progress,
                at,
                chapters,
                videos,
                quiz_attempts,
                actor,
            } => {
                let timestamp = parse_timestamp(at.as_deref())?;
                let mut update = ProgressUpdate::new(student_id, course_id, progress, timestamp);
                update.completed_chapters = chapters;
                update.watched_videos = videos;
                update.quiz_attempts = quiz_attempts;

                let engine = open_engine()?;
                let result = engine.update_progress(actor.into(), update).await;
                print_result(&result)
            }
            Commands::Request { command } => request::execute(command).await,
            Commands::Status {
                student_id,
                course_id,
            } => show_status(student_id, course_id),
            Commands::Gc => gc(),
            Commands::Config => show_config(),
        }
    }
}

/// Open the configured database and build an engine over it.
///
/// Committed events are logged so operators can see what an operation
/// published.
pub(crate) fn open_engine() -> Result<Orchestrator> {
    let cfg = config::config()?;
    let db = open_database()?;

    let bus = Arc::new(EventBus::new());
    bus.subscribe("cli-log", EventFilter::All, |event: &DomainEvent| -> Result<()> {
        info!(
            event_type = ?event.event_type,
            entity_id = %event.entity_id,
            "Published {}.{}",
            event.entity,
            event.action
        );
        Ok(())
    });

    Ok(Orchestrator::with_local_directory(db, cfg.engine.clone(), bus))
}

fn open_database() -> Result<Database> {
    let cfg = config::config()?;
    Database::open(&cfg.database, cfg.engine.busy_timeout())
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))
}

/// Print an operation result as JSON; failures exit with status 1
pub(crate) fn print_result(result: &OperationResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .with_context(|| format!("Invalid timestamp (expected RFC 3339): {}", raw)),
    }
}

fn init() -> Result<()> {
    let cfg = config::config()?;
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    open_database()?;

    println!("Initialized enrollsync database at {}", cfg.database.display());
    Ok(())
}

fn add_user(user_id: i64, role: UserRole, active: bool) -> Result<()> {
    let directory = SqliteDirectory::new(open_database()?);
    directory.add_user(&UserProfile {
        id: user_id,
        role,
        active,
    })?;

    println!("User {} saved ({}, {})", user_id, role, if active { "active" } else { "inactive" });
    Ok(())
}

fn add_course(course_id: i64, title: String, published: bool) -> Result<()> {
    let directory = SqliteDirectory::new(open_database()?);
    directory.add_course(&CourseInfo {
        id: course_id,
        title: title.clone(),
        published,
    })?;

    println!(
        "Course {} saved: {} ({})",
        course_id,
        title,
        if published { "published" } else { "unpublished" }
    );
    Ok(())
}

fn show_status(student_id: i64, course_id: i64) -> Result<()> {
    let engine = open_engine()?;
    let key = EnrollmentKey::new(student_id, course_id);

    let status = json!({
        "enrollment": engine.enrollment(student_id, course_id)?,
        "legacy_progress": engine.legacy_progress(student_id, course_id)?,
        "locked": engine.locks().is_locked("enrollment", &key.lock_params())?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn gc() -> Result<()> {
    let engine = open_engine()?;
    let report = engine.purge_expired()?;

    println!("Removed {} expired idempotency records", report.idempotency_records);
    println!("Removed {} stale locks", report.stale_locks);
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("enrollsync configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Engine:");
    println!("  Lock timeout:       {}ms", cfg.engine.lock_timeout_ms);
    println!("  Lock poll interval: {}ms", cfg.engine.lock_poll_interval_ms);
    println!("  Lock lease:         {}s", cfg.engine.lock_lease_seconds);
    println!("  Idempotency TTL:    {}h", cfg.engine.idempotency_ttl_hours);
    println!("  Failure policy:     {:?}", cfg.engine.failure_policy);
    println!("  Legacy mirror:      {}", cfg.engine.legacy_mirror);
    println!("  Busy timeout:       {}ms", cfg.engine.busy_timeout_ms);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_command() {
        let cli = Cli::try_parse_from([
            "enrollsync",
            "progress",
            "5",
            "3",
            "40",
            "--chapter",
            "intro",
            "--chapter",
            "basics",
            "--actor",
            "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Progress {
                student_id,
                progress,
                chapters,
                actor,
                ..
            } => {
                assert_eq!(student_id, 5);
                assert_eq!(progress, 40);
                assert_eq!(chapters, vec!["intro", "basics"]);
                assert_eq!(Actor::from(actor), Actor::student(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_actor_role_flag() {
        let cli =
            Cli::try_parse_from(["enrollsync", "enroll", "42", "7", "--actor", "1", "--role", "admin"])
                .unwrap();
        match cli.command {
            Commands::Enroll { actor, .. } => assert!(Actor::from(actor).is_admin()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp(Some("2024-03-01T10:00:00Z")).unwrap();
        assert_eq!(ts.timestamp(), 1_709_287_200);
        assert!(parse_timestamp(Some("yesterday")).is_err());
    }
}
