//! Playbook outcome statistics.

use chrono::Utc;
use clap::Subcommand;
use nudgeflow_core::{ContextKey, RecommendationType};

use super::{print_json, CliResult, Session};

#[derive(Subcommand)]
pub enum PlaybookAction {
    /// Show entries for a context key (energy:capacity:day:season)
    Show {
        /// Context key, e.g. "low:overloaded:weekend:high"
        key: ContextKey,
    },
    /// Record the outcome of an intervention
    Record {
        /// Context key
        key: ContextKey,
        /// Intervention type (e.g. "rest_block")
        intervention: RecommendationType,
        /// The intervention failed
        #[arg(long)]
        failed: bool,
    },
}

pub fn run(action: PlaybookAction) -> CliResult {
    let session = Session::open(&[])?;
    let store = session.pipeline.store();

    match action {
        PlaybookAction::Show { key } => {
            print_json(&store.playbook_entries(&key)?)?;
        }
        PlaybookAction::Record {
            key,
            intervention,
            failed,
        } => {
            store.record_playbook_outcome(&key, intervention, !failed, Utc::now())?;
            print_json(&store.playbook_entries(&key)?)?;
        }
    }
    Ok(())
}
