pub mod classify;
pub mod config;
pub mod generate;
pub mod playbook;
pub mod rec;
pub mod signal;
pub mod trace;

use chrono::{DateTime, Utc};
use nudgeflow_core::{Config, Pipeline, RecordingCommands, StaticSnapshotAssembler, Store, UserStateSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Pipeline over the default store and config. Entity commands are
/// recorded and printed rather than sent anywhere.
pub struct Session {
    pub pipeline: Arc<Pipeline>,
    pub commands: Arc<RecordingCommands>,
}

impl Session {
    pub fn open(snapshot_files: &[PathBuf]) -> Result<Self, Box<dyn std::error::Error>> {
        let snapshots = snapshot_files
            .iter()
            .map(|path| read_snapshot(path))
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_snapshots(snapshots)
    }

    pub fn with_snapshots(list: Vec<UserStateSnapshot>) -> Result<Self, Box<dyn std::error::Error>> {
        let snapshots = StaticSnapshotAssembler::new();
        for snapshot in list {
            snapshots.insert(snapshot);
        }
        let commands = Arc::new(RecordingCommands::new());
        let pipeline = Pipeline::builder(
            Arc::new(Store::open()?),
            Config::load()?,
            Arc::new(snapshots),
            commands.clone(),
        )
        .build();
        Ok(Self {
            pipeline: Arc::new(pipeline),
            commands,
        })
    }
}

pub fn read_snapshot(path: &Path) -> Result<UserStateSnapshot, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(serde_json::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))?)
}

pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

/// Parse an RFC3339 timestamp argument.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
