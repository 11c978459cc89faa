//! User-state snapshots.
//!
//! The snapshot is a read-only projection of the user's goals, habits, tasks
//! and capacity, produced by a collaborator the core does not own. The core
//! only defines the shape it needs and the [`SnapshotAssembler`] seam.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalSummary {
    pub id: String,
    pub title: String,
    /// Last time progress was recorded (None = never).
    #[serde(default)]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    /// Fraction complete, 0.0 to 1.0.
    #[serde(default)]
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HabitSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub last_check_in: Option<NaiveDate>,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub best_streak: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    /// 1 (highest) to 5 (lowest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub effort: Effort,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
    /// Fixed commitments cannot be moved by a reschedule.
    #[serde(default)]
    pub fixed: bool,
}

fn default_priority() -> u8 {
    3
}

/// Point-in-time view of one user's state for a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStateSnapshot {
    pub user_id: String,
    pub taken_at: DateTime<Utc>,
    /// The user's local calendar date at `taken_at`.
    pub local_date: NaiveDate,
    /// Self-reported energy, 1 to 5.
    pub energy_level: u8,
    /// Planned load divided by available time.
    pub capacity_utilization: f64,
    /// Season intensity, 1 to 5.
    pub season_intensity: u8,
    #[serde(default)]
    pub goals: Vec<GoalSummary>,
    #[serde(default)]
    pub habits: Vec<HabitSummary>,
    #[serde(default)]
    pub tasks: Vec<TaskSummary>,
}

impl UserStateSnapshot {
    /// Empty snapshot with neutral readings, mostly useful as a builder base.
    pub fn new(user_id: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            taken_at,
            local_date: taken_at.date_naive(),
            energy_level: 3,
            capacity_utilization: 0.5,
            season_intensity: 3,
            goals: Vec::new(),
            habits: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn weekday(&self) -> Weekday {
        self.local_date.weekday()
    }

    pub fn task(&self, id: &str) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Error reported by a snapshot collaborator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SnapshotError(pub String);

/// Produces the user-state snapshot for a pipeline run.
#[async_trait]
pub trait SnapshotAssembler: Send + Sync {
    async fn assemble(&self, user_id: &str) -> Result<UserStateSnapshot, SnapshotError>;
}

/// Assembler backed by snapshots registered in memory.
///
/// Used by the CLI (snapshots read from JSON files) and by tests.
#[derive(Default)]
pub struct StaticSnapshotAssembler {
    snapshots: RwLock<HashMap<String, UserStateSnapshot>>,
}

impl StaticSnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: UserStateSnapshot) {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(snapshot.user_id.clone(), snapshot);
    }
}

#[async_trait]
impl SnapshotAssembler for StaticSnapshotAssembler {
    async fn assemble(&self, user_id: &str) -> Result<UserStateSnapshot, SnapshotError> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        snapshots
            .get(user_id)
            .cloned()
            .ok_or_else(|| SnapshotError(format!("no snapshot registered for user '{user_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_deserializes_with_defaults() {
        let json = r#"{
            "user_id": "u1",
            "taken_at": "2026-03-07T10:00:00Z",
            "local_date": "2026-03-07",
            "energy_level": 2,
            "capacity_utilization": 1.3,
            "season_intensity": 5,
            "tasks": [{"id": "t1", "title": "Write report"}]
        }"#;
        let snapshot: UserStateSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.weekday(), Weekday::Sat);
        assert_eq!(snapshot.tasks[0].priority, 3);
        assert_eq!(snapshot.tasks[0].effort, Effort::Medium);
        assert!(snapshot.goals.is_empty());
    }

    #[tokio::test]
    async fn test_static_assembler_reports_missing_user() {
        let assembler = StaticSnapshotAssembler::new();
        assembler.insert(UserStateSnapshot::new("u1", Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap()));

        assert!(assembler.assemble("u1").await.is_ok());
        assert!(assembler.assemble("u2").await.is_err());
    }
}
