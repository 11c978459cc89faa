//! Signal ingestion and window processing commands.

use chrono::Utc;
use clap::Subcommand;
use nudgeflow_core::signals::IngestOutcome;
use nudgeflow_core::DomainEvent;
use serde_json::json;
use std::path::PathBuf;

use super::{parse_time, print_json, runtime, CliResult, Session};

#[derive(Subcommand)]
pub enum SignalAction {
    /// Classify a domain event and queue it as a signal
    Ingest {
        /// User ID
        user_id: String,
        /// Event type (e.g. "task.overdue")
        event_type: String,
        /// Event payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Occurrence time, RFC3339 (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// List unconsumed signals for a user
    Pending {
        /// User ID
        user_id: String,
    },
    /// Show users whose processing windows have closed
    Due,
    /// Run the pipeline for every due user
    Process {
        /// Snapshot JSON files, one per user
        #[arg(long = "snapshot")]
        snapshots: Vec<PathBuf>,
    },
    /// Delete consumed signals past the retention period
    Purge,
}

pub fn run(action: SignalAction) -> CliResult {
    match action {
        SignalAction::Ingest {
            user_id,
            event_type,
            payload,
            at,
        } => {
            let session = Session::open(&[])?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).map_err(|e| format!("invalid payload: {e}"))?;
            let mut event = DomainEvent::new(user_id, event_type, payload);
            if let Some(at) = at {
                event = event.at(parse_time(&at)?);
            }
            match session.pipeline.ingest(&event)? {
                IngestOutcome::Queued(entry) => print_json(&json!({ "outcome": "queued", "signal": entry }))?,
                IngestOutcome::NoSignal => print_json(&json!({ "outcome": "no_signal" }))?,
                IngestOutcome::Unmapped => print_json(&json!({ "outcome": "unmapped" }))?,
            }
        }
        SignalAction::Pending { user_id } => {
            let session = Session::open(&[])?;
            let signals = session.pipeline.store().unconsumed_signals(&user_id, Utc::now())?;
            print_json(&signals)?;
        }
        SignalAction::Due => {
            let session = Session::open(&[])?;
            print_json(&session.pipeline.due_users(Utc::now())?)?;
        }
        SignalAction::Process { snapshots } => {
            let session = Session::open(&snapshots)?;
            let runs = runtime()?.block_on(session.pipeline.process_due(Utc::now()))?;
            let rows: Vec<serde_json::Value> = runs
                .into_iter()
                .map(|run| match run.result {
                    Ok(report) => json!({ "user_id": run.user_id, "window": run.window, "report": report }),
                    Err(e) => json!({ "user_id": run.user_id, "window": run.window, "error": e.to_string() }),
                })
                .collect();
            print_json(&rows)?;
        }
        SignalAction::Purge => {
            let session = Session::open(&[])?;
            let purged = session.pipeline.purge_consumed_signals(Utc::now())?;
            print_json(&json!({ "purged": purged }))?;
        }
    }
    Ok(())
}
