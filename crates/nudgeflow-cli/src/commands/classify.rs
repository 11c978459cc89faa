//! Event classification table commands.

use clap::Subcommand;
use nudgeflow_core::signals::Classification;
use serde_json::json;

use super::{print_json, CliResult, Session};

#[derive(Subcommand)]
pub enum ClassifyAction {
    /// List the effective classification table
    List,
    /// Classify one event type
    Show {
        /// Event type (e.g. "habit.missed")
        event_type: String,
    },
}

pub fn run(action: ClassifyAction) -> CliResult {
    let session = Session::open(&[])?;
    let classifier = session.pipeline.classifier();

    match action {
        ClassifyAction::List => {
            let table: serde_json::Map<String, serde_json::Value> = classifier
                .table()
                .entries()
                .map(|(event_type, class)| Ok((event_type.to_string(), serde_json::to_value(class)?)))
                .collect::<Result<_, serde_json::Error>>()?;
            print_json(&table)?;
        }
        ClassifyAction::Show { event_type } => {
            let value = match classifier.classify(&event_type) {
                Classification::Signal { priority, window } => {
                    json!({ "event_type": event_type, "kind": "signal", "priority": priority, "window": window })
                }
                Classification::NoSignal => json!({ "event_type": event_type, "kind": "no_signal" }),
                Classification::Unmapped => json!({ "event_type": event_type, "kind": "unmapped" }),
            };
            print_json(&value)?;
        }
    }
    Ok(())
}
