//! Recommendation records and their lifecycle.

pub mod lifecycle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

pub use lifecycle::{LifecycleConfig, LifecycleManager, MaterializeOutcome, WakeReport};

/// Kind of intervention a recommendation proposes. Also the playbook's
/// intervention type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    StartHabit,
    RestartHabit,
    RescheduleTask,
    BreakDownTask,
    ReviewGoal,
    ReduceLoad,
    RestBlock,
    StartExperiment,
}

impl RecommendationType {
    pub const ALL: [RecommendationType; 8] = [
        RecommendationType::StartHabit,
        RecommendationType::RestartHabit,
        RecommendationType::RescheduleTask,
        RecommendationType::BreakDownTask,
        RecommendationType::ReviewGoal,
        RecommendationType::ReduceLoad,
        RecommendationType::RestBlock,
        RecommendationType::StartExperiment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationType::StartHabit => "start_habit",
            RecommendationType::RestartHabit => "restart_habit",
            RecommendationType::RescheduleTask => "reschedule_task",
            RecommendationType::BreakDownTask => "break_down_task",
            RecommendationType::ReviewGoal => "review_goal",
            RecommendationType::ReduceLoad => "reduce_load",
            RecommendationType::RestBlock => "rest_block",
            RecommendationType::StartExperiment => "start_experiment",
        }
    }

    /// Action used when a candidate of this type is synthesized without a rule
    /// supplying one (playbook hits).
    pub fn default_action(&self) -> ActionKind {
        match self {
            RecommendationType::StartHabit => ActionKind::OpenHabitForm,
            RecommendationType::RestartHabit => ActionKind::OpenHabitForm,
            RecommendationType::RescheduleTask => ActionKind::OpenTaskForm,
            RecommendationType::BreakDownTask => ActionKind::OpenTaskForm,
            RecommendationType::ReviewGoal => ActionKind::OpenGoalReview,
            RecommendationType::ReduceLoad => ActionKind::Reflect,
            RecommendationType::RestBlock => ActionKind::CreateTask,
            RecommendationType::StartExperiment => ActionKind::StartExperiment,
        }
    }

    /// Generic wording for synthesized candidates.
    pub fn headline(&self) -> &'static str {
        match self {
            RecommendationType::StartHabit => "Start a small supporting habit",
            RecommendationType::RestartHabit => "Restart a lapsed habit",
            RecommendationType::RescheduleTask => "Move a task to a better slot",
            RecommendationType::BreakDownTask => "Break a large task into steps",
            RecommendationType::ReviewGoal => "Review a goal that has gone quiet",
            RecommendationType::ReduceLoad => "Trim today's plan",
            RecommendationType::RestBlock => "Block out time to recover",
            RecommendationType::StartExperiment => "Try a short experiment",
        }
    }
}

impl fmt::Display for RecommendationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::invalid("recommendation_type", s))
    }
}

/// Surface a recommendation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationContext {
    /// Reactions to immediate signals.
    Momentum,
    DailyPlan,
    WeeklyReview,
    /// Explicit user request for fresh recommendations.
    OnDemand,
}

impl RecommendationContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationContext::Momentum => "momentum",
            RecommendationContext::DailyPlan => "daily_plan",
            RecommendationContext::WeeklyReview => "weekly_review",
            RecommendationContext::OnDemand => "on_demand",
        }
    }

    /// Context used for runs started by a closing window.
    pub fn for_window(window: crate::signals::WindowType) -> Self {
        match window {
            crate::signals::WindowType::Immediate => RecommendationContext::Momentum,
            crate::signals::WindowType::DailyWindow => RecommendationContext::DailyPlan,
            crate::signals::WindowType::WeeklyWindow => RecommendationContext::WeeklyReview,
        }
    }
}

impl fmt::Display for RecommendationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationContext {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "momentum" => Ok(RecommendationContext::Momentum),
            "daily_plan" => Ok(RecommendationContext::DailyPlan),
            "weekly_review" => Ok(RecommendationContext::WeeklyReview),
            "on_demand" => Ok(RecommendationContext::OnDemand),
            other => Err(ValidationError::invalid("context", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Goal,
    Task,
    Habit,
    Experiment,
    General,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Goal => "goal",
            TargetKind::Task => "task",
            TargetKind::Habit => "habit",
            TargetKind::Experiment => "experiment",
            TargetKind::General => "general",
        }
    }
}

impl FromStr for TargetKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "goal" => Ok(TargetKind::Goal),
            "task" => Ok(TargetKind::Task),
            "habit" => Ok(TargetKind::Habit),
            "experiment" => Ok(TargetKind::Experiment),
            "general" => Ok(TargetKind::General),
            other => Err(ValidationError::invalid("target_kind", other)),
        }
    }
}

/// What accepting a recommendation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateTask,
    RescheduleTask,
    CreateHabit,
    PauseHabit,
    StartExperiment,
    OpenTaskForm,
    OpenHabitForm,
    OpenGoalReview,
    Reflect,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::CreateTask,
        ActionKind::RescheduleTask,
        ActionKind::CreateHabit,
        ActionKind::PauseHabit,
        ActionKind::StartExperiment,
        ActionKind::OpenTaskForm,
        ActionKind::OpenHabitForm,
        ActionKind::OpenGoalReview,
        ActionKind::Reflect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateTask => "create_task",
            ActionKind::RescheduleTask => "reschedule_task",
            ActionKind::CreateHabit => "create_habit",
            ActionKind::PauseHabit => "pause_habit",
            ActionKind::StartExperiment => "start_experiment",
            ActionKind::OpenTaskForm => "open_task_form",
            ActionKind::OpenHabitForm => "open_habit_form",
            ActionKind::OpenGoalReview => "open_goal_review",
            ActionKind::Reflect => "reflect",
        }
    }

    /// Server-executable kinds write through a collaborator command; the rest
    /// are handed to the client as a form pre-fill.
    pub fn is_server_executable(&self) -> bool {
        matches!(
            self,
            ActionKind::CreateTask
                | ActionKind::RescheduleTask
                | ActionKind::CreateHabit
                | ActionKind::PauseHabit
                | ActionKind::StartExperiment
        )
    }
}

impl FromStr for ActionKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::invalid("action_kind", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Active,
    Accepted,
    Dismissed,
    Snoozed,
    Expired,
    Executed,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Active => "active",
            RecommendationStatus::Accepted => "accepted",
            RecommendationStatus::Dismissed => "dismissed",
            RecommendationStatus::Snoozed => "snoozed",
            RecommendationStatus::Expired => "expired",
            RecommendationStatus::Executed => "executed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecommendationStatus::Dismissed | RecommendationStatus::Expired | RecommendationStatus::Executed
        )
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecommendationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RecommendationStatus::Active),
            "accepted" => Ok(RecommendationStatus::Accepted),
            "dismissed" => Ok(RecommendationStatus::Dismissed),
            "snoozed" => Ok(RecommendationStatus::Snoozed),
            "expired" => Ok(RecommendationStatus::Expired),
            "executed" => Ok(RecommendationStatus::Executed),
            other => Err(ValidationError::invalid("status", other)),
        }
    }
}

/// A proposal a rule (or a higher tier) is confident enough to emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectRecommendationCandidate {
    #[serde(rename = "type")]
    pub rec_type: RecommendationType,
    pub context: RecommendationContext,
    pub target_kind: TargetKind,
    #[serde(default)]
    pub target_entity_id: Option<String>,
    #[serde(default)]
    pub target_entity_title: Option<String>,
    pub action_kind: ActionKind,
    pub title: String,
    pub rationale: String,
    pub score: f64,
    #[serde(default)]
    pub action_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub action_summary: Option<String>,
}

impl DirectRecommendationCandidate {
    /// Identity used for dedup: `(context, target kind, target id)`.
    pub fn target_key(&self) -> (RecommendationContext, TargetKind, Option<&str>) {
        (self.context, self.target_kind, self.target_entity_id.as_deref())
    }
}

/// The durable recommendation entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub rec_type: RecommendationType,
    pub context: RecommendationContext,
    pub status: RecommendationStatus,
    pub target_kind: TargetKind,
    pub target_entity_id: Option<String>,
    pub target_entity_title: Option<String>,
    pub action_kind: ActionKind,
    pub action_payload: Option<serde_json::Value>,
    pub action_summary: Option<String>,
    pub title: String,
    pub rationale: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub dismiss_reason: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub executed_entity_id: Option<String>,
}

impl Recommendation {
    /// New Active recommendation from a candidate.
    pub fn from_candidate(id: String, user_id: &str, candidate: &DirectRecommendationCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: user_id.to_string(),
            rec_type: candidate.rec_type,
            context: candidate.context,
            status: RecommendationStatus::Active,
            target_kind: candidate.target_kind,
            target_entity_id: candidate.target_entity_id.clone(),
            target_entity_title: candidate.target_entity_title.clone(),
            action_kind: candidate.action_kind,
            action_payload: candidate.action_payload.clone(),
            action_summary: candidate.action_summary.clone(),
            title: candidate.title.clone(),
            rationale: candidate.rationale.clone(),
            score: candidate.score,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            dismissed_at: None,
            dismiss_reason: None,
            snoozed_until: None,
            executed_at: None,
            executed_entity_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_forms_parse_back() {
        for t in RecommendationType::ALL {
            assert_eq!(t.as_str().parse::<RecommendationType>().unwrap(), t);
        }
        for k in ActionKind::ALL {
            assert_eq!(k.as_str().parse::<ActionKind>().unwrap(), k);
        }
        assert!("nudge".parse::<RecommendationType>().is_err());
    }

    #[test]
    fn test_server_executable_split() {
        assert!(ActionKind::CreateTask.is_server_executable());
        assert!(ActionKind::RescheduleTask.is_server_executable());
        assert!(!ActionKind::OpenHabitForm.is_server_executable());
        assert!(!ActionKind::Reflect.is_server_executable());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RecommendationStatus::Executed.is_terminal());
        assert!(RecommendationStatus::Dismissed.is_terminal());
        assert!(!RecommendationStatus::Accepted.is_terminal());
        assert!(!RecommendationStatus::Snoozed.is_terminal());
    }

    #[test]
    fn test_candidate_json_uses_type_field() {
        let json = serde_json::json!({
            "type": "reschedule_task",
            "context": "daily_plan",
            "target_kind": "task",
            "target_entity_id": "t1",
            "action_kind": "reschedule_task",
            "title": "Move it",
            "rationale": "Overdue",
            "score": 0.7
        });
        let candidate: DirectRecommendationCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(candidate.rec_type, RecommendationType::RescheduleTask);
        assert_eq!(candidate.target_key(), (RecommendationContext::DailyPlan, TargetKind::Task, Some("t1")));
    }
}
