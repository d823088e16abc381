//! Access request CLI subcommands.
//!
//! - `create`: file a pending request for a course
//! - `approve`: approve a request and enroll the student
//! - `reject`: reject a request with an optional note
//! - `show`: print a request

use anyhow::Result;
use clap::Subcommand;

use super::{open_engine, print_result, ActorArgs};
use crate::domain::{NewAccessRequest, RequestReview};

/// Access-request subcommands
#[derive(Subcommand, Debug)]
pub enum RequestCommands {
    /// Request access to a course
    Create {
        student_id: i64,
        course_id: i64,

        /// Message to the reviewer
        #[arg(short, long)]
        message: Option<String>,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Approve a pending request
    Approve {
        request_id: i64,

        /// Review note
        #[arg(short, long)]
        note: Option<String>,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Reject a pending request
    Reject {
        request_id: i64,

        /// Review note
        #[arg(short, long)]
        note: Option<String>,

        #[command(flatten)]
        actor: ActorArgs,
    },

    /// Show a request
    Show { request_id: i64 },
}

/// Execute request subcommands
pub async fn execute(command: RequestCommands) -> Result<()> {
    let engine = open_engine()?;

    match command {
        RequestCommands::Create {
            student_id,
            course_id,
            message,
            actor,
        } => {
            let request = NewAccessRequest {
                student_id,
                course_id,
                message,
            };
            print_result(&engine.create_request(actor.into(), request).await)
        }
        RequestCommands::Approve {
            request_id,
            note,
            actor,
        } => print_result(&engine.approve_request(actor.into(), review(request_id, note)).await),
        RequestCommands::Reject {
            request_id,
            note,
            actor,
        } => print_result(&engine.reject_request(actor.into(), review(request_id, note)).await),
        RequestCommands::Show { request_id } => {
            match engine.access_request(request_id)? {
                Some(request) => println!("{}", serde_json::to_string_pretty(&request)?),
                None => anyhow::bail!("Access request {} not found", request_id),
            }
            Ok(())
        }
    }
}

fn review(request_id: i64, note: Option<String>) -> RequestReview {
    match note {
        Some(note) => RequestReview::new(request_id).with_note(note),
        None => RequestReview::new(request_id),
    }
}
