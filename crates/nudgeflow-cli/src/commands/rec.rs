//! Recommendation lifecycle commands.

use chrono::Utc;
use clap::Subcommand;
use nudgeflow_core::{RecommendationContext, RecommendationStatus};
use serde_json::json;

use super::{parse_time, print_json, runtime, CliResult, Session};

#[derive(Subcommand)]
pub enum RecAction {
    /// List a user's recommendations, best first
    List {
        /// User ID
        user_id: String,
        /// Filter by status (active, accepted, dismissed, snoozed, expired, executed)
        #[arg(long)]
        status: Option<RecommendationStatus>,
        /// Filter by context
        #[arg(long)]
        context: Option<RecommendationContext>,
    },
    /// Show one recommendation
    Get {
        /// Recommendation ID
        id: String,
    },
    /// Accept a recommendation and execute its action
    Accept {
        /// Recommendation ID
        id: String,
    },
    /// Retry execution of an accepted recommendation
    Execute {
        /// Recommendation ID
        id: String,
    },
    /// Dismiss a recommendation
    Dismiss {
        /// Recommendation ID
        id: String,
        /// Why it was dismissed
        #[arg(long)]
        reason: Option<String>,
    },
    /// Snooze a recommendation
    Snooze {
        /// Recommendation ID
        id: String,
        /// Wake time, RFC3339 (default: configured snooze period)
        #[arg(long)]
        until: Option<String>,
    },
    /// Return snoozed recommendations whose time has come
    Wake,
    /// Expire active recommendations nobody acted on
    Expire,
}

pub fn run(action: RecAction) -> CliResult {
    let session = Session::open(&[])?;
    let pipeline = &session.pipeline;
    let now = Utc::now();

    match action {
        RecAction::List {
            user_id,
            status,
            context,
        } => {
            let recs = pipeline.store().list_recommendations(&user_id, status, context)?;
            print_json(&recs)?;
        }
        RecAction::Get { id } => {
            print_json(&pipeline.lifecycle().get(&id)?)?;
        }
        RecAction::Accept { id } => {
            let result = runtime()?.block_on(pipeline.accept(&id, now))?;
            print_json(&json!({ "result": result, "issued": session.commands.issued() }))?;
        }
        RecAction::Execute { id } => {
            let result = runtime()?.block_on(pipeline.execute(&id, now))?;
            print_json(&json!({ "result": result, "issued": session.commands.issued() }))?;
        }
        RecAction::Dismiss { id, reason } => {
            print_json(&pipeline.dismiss(&id, reason, now)?)?;
        }
        RecAction::Snooze { id, until } => {
            let until = until.as_deref().map(parse_time).transpose()?;
            print_json(&pipeline.snooze(&id, until, now)?)?;
        }
        RecAction::Wake => {
            print_json(&pipeline.wake_snoozed(now)?)?;
        }
        RecAction::Expire => {
            let expired = pipeline.expire_stale(now)?;
            print_json(&json!({ "expired": expired }))?;
        }
    }
    Ok(())
}
