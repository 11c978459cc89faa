//! Built-in rule set.

use chrono::{Days, NaiveDate};
use serde_json::json;
use std::collections::BTreeSet;

use super::{Rule, RuleError, RuleInput, RuleResult, Severity};
use crate::context::{CapacityBucket, LevelBucket};
use crate::recommendation::{ActionKind, DirectRecommendationCandidate, RecommendationType, TargetKind};
use crate::snapshot::{Effort, TaskSummary};

/// Every built-in rule with its default parameters.
pub fn builtin_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(CapacityOverloadRule),
        Box::new(OverdueTaskRule),
        Box::new(HabitLapseRule::default()),
        Box::new(StalledGoalRule::default()),
        Box::new(LowEnergyRule),
        Box::new(EmptyRoutineRule),
    ]
}

fn day_after(date: NaiveDate) -> NaiveDate {
    date.checked_add_days(Days::new(1)).unwrap_or(date)
}

/// Candidate skeleton in the run's context with no target.
fn candidate(
    input: &RuleInput<'_>,
    rec_type: RecommendationType,
    action_kind: ActionKind,
    title: String,
    rationale: String,
    score: f64,
) -> DirectRecommendationCandidate {
    DirectRecommendationCandidate {
        rec_type,
        context: input.context,
        target_kind: TargetKind::General,
        target_entity_id: None,
        target_entity_title: None,
        action_kind,
        title,
        rationale,
        score,
        action_payload: None,
        action_summary: None,
    }
}

/// Planned load far above available time.
pub struct CapacityOverloadRule;

impl CapacityOverloadRule {
    /// Lowest-priority task that may be moved; undated tasks move first.
    fn most_movable<'a>(tasks: &'a [TaskSummary]) -> Option<&'a TaskSummary> {
        tasks.iter().filter(|t| !t.fixed).max_by(|a, b| {
            let due = |t: &TaskSummary| t.due_date.unwrap_or(NaiveDate::MAX);
            (a.priority, due(a), &b.id).cmp(&(b.priority, due(b), &a.id))
        })
    }
}

impl Rule for CapacityOverloadRule {
    fn id(&self) -> &'static str {
        "capacity-overload"
    }

    fn name(&self) -> &'static str {
        "Capacity overload"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let snapshot = input.snapshot;
        let utilization = snapshot.capacity_utilization;
        if input.thresholds.capacity(utilization) != CapacityBucket::Overloaded {
            return Ok(RuleResult::not_triggered(self));
        }

        let rationale = format!("Planned work is {:.0}% of the time available.", utilization * 100.0);
        let movable = snapshot.tasks.iter().filter(|t| !t.fixed).count();
        let result = RuleResult::triggered(self, Severity::Critical)
            .with_evidence("capacity_utilization", utilization)
            .with_evidence("capacity_bucket", CapacityBucket::Overloaded.as_str())
            .with_evidence("movable_task_count", movable);

        let candidate = match Self::most_movable(&snapshot.tasks) {
            Some(task) => {
                let new_date = day_after(task.due_date.unwrap_or(snapshot.local_date).max(snapshot.local_date));
                DirectRecommendationCandidate {
                    target_kind: TargetKind::Task,
                    target_entity_id: Some(task.id.clone()),
                    target_entity_title: Some(task.title.clone()),
                    action_payload: Some(json!({ "task_id": task.id, "new_due_date": new_date })),
                    action_summary: Some(format!("Reschedule to {new_date}")),
                    ..candidate(
                        input,
                        RecommendationType::RescheduleTask,
                        ActionKind::RescheduleTask,
                        format!("Move \"{}\" to {new_date}", task.title),
                        rationale,
                        0.9,
                    )
                }
            }
            None => candidate(
                input,
                RecommendationType::ReduceLoad,
                ActionKind::Reflect,
                RecommendationType::ReduceLoad.headline().to_string(),
                format!("{rationale} Every remaining task is a fixed commitment."),
                0.85,
            ),
        };

        Ok(result.with_candidate(candidate))
    }
}

/// Tasks past their due date.
pub struct OverdueTaskRule;

impl Rule for OverdueTaskRule {
    fn id(&self) -> &'static str {
        "overdue-task"
    }

    fn name(&self) -> &'static str {
        "Overdue task"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let today = input.snapshot.local_date;
        let overdue: Vec<(&TaskSummary, NaiveDate)> = input
            .snapshot
            .tasks
            .iter()
            .filter(|t| !t.fixed)
            .filter_map(|t| t.due_date.filter(|due| *due < today).map(|due| (t, due)))
            .collect();

        let Some((task, due)) = overdue
            .iter()
            .min_by(|(a, a_due), (b, b_due)| (a_due, a.priority, &a.id).cmp(&(b_due, b.priority, &b.id)))
            .copied()
        else {
            return Ok(RuleResult::not_triggered(self));
        };

        let days_overdue = (today - due).num_days();
        let severity = if days_overdue >= 7 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let score = 0.6 + 0.3 * (days_overdue.min(14) as f64 / 14.0);
        let new_date = day_after(today);

        let candidate = DirectRecommendationCandidate {
            target_kind: TargetKind::Task,
            target_entity_id: Some(task.id.clone()),
            target_entity_title: Some(task.title.clone()),
            action_payload: Some(json!({ "task_id": task.id, "new_due_date": new_date })),
            action_summary: Some(format!("Reschedule to {new_date}")),
            ..candidate(
                input,
                RecommendationType::RescheduleTask,
                ActionKind::RescheduleTask,
                format!("Reschedule \"{}\"", task.title),
                format!("It was due {days_overdue} day(s) ago."),
                score,
            )
        };

        Ok(RuleResult::triggered(self, severity)
            .with_evidence("task_id", task.id.as_str())
            .with_evidence("days_overdue", days_overdue)
            .with_evidence("overdue_count", overdue.len())
            .with_candidate(candidate))
    }
}

/// Habits without a recent check-in.
pub struct HabitLapseRule {
    pub lapse_days: i64,
    /// Lapses at least this long are handed to escalation.
    pub escalate_after_days: i64,
}

impl Default for HabitLapseRule {
    fn default() -> Self {
        Self {
            lapse_days: 3,
            escalate_after_days: 14,
        }
    }
}

impl Rule for HabitLapseRule {
    fn id(&self) -> &'static str {
        "habit-lapse"
    }

    fn name(&self) -> &'static str {
        "Habit lapse"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let today = input.snapshot.local_date;
        let missed: BTreeSet<&str> = input
            .signals_of("habit.missed")
            .into_iter()
            .filter_map(|s| s.payload.get("habit_id").and_then(|v| v.as_str()))
            .collect();

        let lapsed = input
            .snapshot
            .habits
            .iter()
            .map(|h| (h, h.last_check_in.map(|d| (today - d).num_days())))
            .filter(|(h, days)| days.is_some_and(|d| d >= self.lapse_days) || missed.contains(h.id.as_str()))
            .max_by(|(a, a_days), (b, b_days)| (a_days.unwrap_or(0), &b.id).cmp(&(b_days.unwrap_or(0), &a.id)));

        let Some((habit, days)) = lapsed else {
            return Ok(RuleResult::not_triggered(self));
        };

        let rationale = match days {
            Some(d) if d >= self.lapse_days => format!("No check-in for {d} days."),
            _ => "A scheduled check-in was missed.".to_string(),
        };
        let candidate = DirectRecommendationCandidate {
            target_kind: TargetKind::Habit,
            target_entity_id: Some(habit.id.clone()),
            target_entity_title: Some(habit.title.clone()),
            action_payload: Some(json!({ "habit_id": habit.id, "best_streak": habit.best_streak })),
            ..candidate(
                input,
                RecommendationType::RestartHabit,
                ActionKind::OpenHabitForm,
                format!("Restart \"{}\"", habit.title),
                rationale,
                0.7,
            )
        };

        let mut result = RuleResult::triggered(self, Severity::Warning)
            .with_evidence("target_kind", TargetKind::Habit.as_str())
            .with_evidence("target_entity_id", habit.id.as_str())
            .with_evidence("target_entity_title", habit.title.as_str())
            .with_evidence("days_since_check_in", days)
            .with_evidence("missed_signals", missed.len())
            .with_candidate(candidate);
        if days.is_some_and(|d| d >= self.escalate_after_days) {
            result = result.escalate();
        }
        Ok(result)
    }
}

/// Goals without progress for a long time. Detects the stall only; the
/// intervention is chosen by escalation.
pub struct StalledGoalRule {
    pub stall_days: i64,
}

impl Default for StalledGoalRule {
    fn default() -> Self {
        Self { stall_days: 14 }
    }
}

impl Rule for StalledGoalRule {
    fn id(&self) -> &'static str {
        "stalled-goal"
    }

    fn name(&self) -> &'static str {
        "Stalled goal"
    }

    fn priority(&self) -> u32 {
        40
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let taken_at = input.snapshot.taken_at;
        let stalled: Vec<_> = input
            .snapshot
            .goals
            .iter()
            .filter(|g| g.progress < 1.0)
            .filter_map(|g| g.last_progress_at.map(|at| (g, (taken_at - at).num_days())))
            .filter(|(_, days)| *days >= self.stall_days)
            .collect();

        let Some((goal, days)) = stalled
            .iter()
            .max_by(|(a, a_days), (b, b_days)| (a_days, &b.id).cmp(&(b_days, &a.id)))
            .copied()
        else {
            return Ok(RuleResult::not_triggered(self));
        };

        Ok(RuleResult::triggered(self, Severity::Warning)
            .with_evidence("target_kind", TargetKind::Goal.as_str())
            .with_evidence("target_entity_id", goal.id.as_str())
            .with_evidence("target_entity_title", goal.title.as_str())
            .with_evidence("days_without_progress", days)
            .with_evidence("progress", goal.progress)
            .with_evidence("stalled_goal_count", stalled.len())
            .escalate())
    }
}

/// Low energy with demanding work due today.
pub struct LowEnergyRule;

impl Rule for LowEnergyRule {
    fn id(&self) -> &'static str {
        "low-energy"
    }

    fn name(&self) -> &'static str {
        "Low energy"
    }

    fn priority(&self) -> u32 {
        50
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let snapshot = input.snapshot;
        if snapshot.energy_level == 0 {
            return Err(RuleError::MissingData("energy level".into()));
        }
        if input.thresholds.energy(snapshot.energy_level) != LevelBucket::Low {
            return Ok(RuleResult::not_triggered(self));
        }

        let demanding: Vec<&str> = snapshot
            .tasks
            .iter()
            .filter(|t| t.effort == Effort::High && t.due_date == Some(snapshot.local_date))
            .map(|t| t.id.as_str())
            .collect();
        if demanding.is_empty() {
            return Ok(RuleResult::not_triggered(self));
        }

        let crashed = input.signals_of("energy.crashed").len();
        let severity = if crashed > 0 {
            Severity::Critical
        } else {
            Severity::Warning
        };

        let fallback = DirectRecommendationCandidate {
            action_payload: Some(json!({
                "title": "Recovery block",
                "due_date": snapshot.local_date,
                "estimated_minutes": 30,
            })),
            action_summary: Some("Add a 30 minute recovery block today".to_string()),
            ..candidate(
                input,
                RecommendationType::RestBlock,
                ActionKind::CreateTask,
                "Block 30 minutes to recover".to_string(),
                format!(
                    "Energy is {}/5 with {} demanding task(s) due today.",
                    snapshot.energy_level,
                    demanding.len()
                ),
                0.65,
            )
        };

        Ok(RuleResult::triggered(self, severity)
            .with_evidence("energy_level", snapshot.energy_level)
            .with_evidence("demanding_task_ids", demanding)
            .with_evidence("energy_crashed_signals", crashed)
            .with_candidate(fallback)
            .escalate())
    }
}

/// Goals with no habits supporting them.
pub struct EmptyRoutineRule;

impl Rule for EmptyRoutineRule {
    fn id(&self) -> &'static str {
        "empty-routine"
    }

    fn name(&self) -> &'static str {
        "Empty routine"
    }

    fn priority(&self) -> u32 {
        60
    }

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError> {
        let snapshot = input.snapshot;
        if !snapshot.habits.is_empty() {
            return Ok(RuleResult::not_triggered(self));
        }
        let Some(goal) = snapshot.goals.iter().min_by(|a, b| {
            a.progress
                .total_cmp(&b.progress)
                .then_with(|| a.id.cmp(&b.id))
        }) else {
            return Ok(RuleResult::not_triggered(self));
        };

        let candidate = DirectRecommendationCandidate {
            target_kind: TargetKind::Habit,
            action_payload: Some(json!({
                "goal_id": goal.id,
                "suggested_title": format!("Daily step toward {}", goal.title),
            })),
            ..candidate(
                input,
                RecommendationType::StartHabit,
                ActionKind::OpenHabitForm,
                format!("Start a small habit for \"{}\"", goal.title),
                format!("{} active goal(s) and no habits supporting them.", snapshot.goals.len()),
                0.45,
            )
        };

        Ok(RuleResult::triggered(self, Severity::Info)
            .with_evidence("goal_count", snapshot.goals.len())
            .with_evidence("anchor_goal_id", goal.id.as_str())
            .with_candidate(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BucketThresholds;
    use crate::events::DomainEvent;
    use crate::recommendation::RecommendationContext;
    use crate::signals::{SignalEntry, SignalPriority, WindowType};
    use crate::snapshot::{GoalSummary, HabitSummary, UserStateSnapshot};
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot() -> UserStateSnapshot {
        // Wednesday
        UserStateSnapshot::new("u1", Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).unwrap())
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn task(id: &str, priority: u8, due: Option<NaiveDate>) -> TaskSummary {
        TaskSummary {
            id: id.to_string(),
            title: format!("Task {id}"),
            priority,
            due_date: due,
            effort: Effort::Medium,
            estimated_minutes: None,
            fixed: false,
        }
    }

    fn habit(id: &str, last: Option<NaiveDate>) -> HabitSummary {
        HabitSummary {
            id: id.to_string(),
            title: format!("Habit {id}"),
            last_check_in: last,
            current_streak: 0,
            best_streak: 9,
        }
    }

    fn goal(id: &str, idle_days: i64, progress: f64) -> GoalSummary {
        GoalSummary {
            id: id.to_string(),
            title: format!("Goal {id}"),
            last_progress_at: Some(snapshot().taken_at - Duration::days(idle_days)),
            target_date: None,
            progress,
        }
    }

    fn eval(rule: &dyn Rule, snapshot: &UserStateSnapshot, signals: &[SignalEntry]) -> RuleResult {
        let thresholds = BucketThresholds::default();
        let input = RuleInput {
            snapshot,
            signals,
            context: RecommendationContext::DailyPlan,
            thresholds: &thresholds,
        };
        rule.evaluate(&input).unwrap()
    }

    #[test]
    fn test_capacity_overload_moves_lowest_priority_task() {
        let mut s = snapshot();
        s.capacity_utilization = 1.5;
        s.tasks = vec![task("urgent", 1, Some(date(4))), task("someday", 5, None), task("soon", 5, Some(date(6)))];
        let mut fixed = task("meeting", 5, Some(date(4)));
        fixed.fixed = true;
        s.tasks.push(fixed);

        let result = eval(&CapacityOverloadRule, &s, &[]);
        assert!(result.triggered);
        assert_eq!(result.severity, Severity::Critical);
        let candidate = result.direct_recommendation.unwrap();
        assert_eq!(candidate.target_entity_id.as_deref(), Some("someday"));
        assert_eq!(candidate.action_kind, ActionKind::RescheduleTask);
        assert_eq!(candidate.action_payload.unwrap()["new_due_date"], "2026-03-05");
    }

    #[test]
    fn test_capacity_overload_with_only_fixed_tasks_reduces_load() {
        let mut s = snapshot();
        s.capacity_utilization = 1.3;
        let result = eval(&CapacityOverloadRule, &s, &[]);
        let candidate = result.direct_recommendation.unwrap();
        assert_eq!(candidate.rec_type, RecommendationType::ReduceLoad);
        assert_eq!(candidate.target_kind, TargetKind::General);
    }

    #[test]
    fn test_capacity_full_is_not_overload() {
        let mut s = snapshot();
        s.capacity_utilization = 1.2;
        assert!(!eval(&CapacityOverloadRule, &s, &[]).triggered);
    }

    #[test]
    fn test_overdue_picks_most_overdue_task() {
        let mut s = snapshot();
        s.tasks = vec![task("a", 2, Some(date(3))), task("b", 3, Some(date(1))), task("c", 1, Some(date(4)))];

        let result = eval(&OverdueTaskRule, &s, &[]);
        assert!(result.triggered);
        assert_eq!(result.evidence["task_id"], "b");
        assert_eq!(result.evidence["days_overdue"], 3);
        assert_eq!(result.evidence["overdue_count"], 2);
        assert_eq!(result.severity, Severity::Warning);
        assert!(!result.requires_escalation);
    }

    #[test]
    fn test_no_overdue_tasks_is_silent() {
        let mut s = snapshot();
        s.tasks = vec![task("a", 2, Some(date(4))), task("b", 2, None)];
        let result = eval(&OverdueTaskRule, &s, &[]);
        assert!(!result.triggered);
        assert!(result.evidence.is_empty());
    }

    #[test]
    fn test_habit_lapse_direct_and_escalated() {
        let mut s = snapshot();
        s.habits = vec![habit("fresh", Some(date(3))), habit("lapsed", Some(date(1)))];
        let result = eval(&HabitLapseRule::default(), &s, &[]);
        assert!(result.triggered);
        assert!(!result.requires_escalation);
        assert_eq!(result.direct_recommendation.unwrap().target_entity_id.as_deref(), Some("lapsed"));

        s.habits.push(habit("abandoned", NaiveDate::from_ymd_opt(2026, 2, 10)));
        let result = eval(&HabitLapseRule::default(), &s, &[]);
        assert!(result.requires_escalation);
        assert_eq!(result.evidence["target_entity_id"], "abandoned");
        assert!(result.direct_recommendation.is_some());
    }

    #[test]
    fn test_habit_missed_signal_triggers_lapse() {
        let mut s = snapshot();
        s.habits = vec![habit("h1", Some(date(4)))];
        let event = DomainEvent::new("u1", "habit.missed", json!({"habit_id": "h1"}));
        let signal = SignalEntry::from_event(&event, SignalPriority::Medium, WindowType::DailyWindow);

        let result = eval(&HabitLapseRule::default(), &s, &[signal]);
        assert!(result.triggered);
        assert_eq!(result.evidence["missed_signals"], 1);
    }

    #[test]
    fn test_stalled_goal_escalates_without_candidate() {
        let mut s = snapshot();
        s.goals = vec![goal("moving", 2, 0.4), goal("stuck", 20, 0.1), goal("done", 60, 1.0)];

        let result = eval(&StalledGoalRule::default(), &s, &[]);
        assert!(result.triggered);
        assert!(result.requires_escalation);
        assert!(result.direct_recommendation.is_none());
        assert_eq!(result.evidence["target_entity_id"], "stuck");
        assert_eq!(result.evidence["stalled_goal_count"], 1);
    }

    #[test]
    fn test_low_energy_needs_demanding_task_today() {
        let mut s = snapshot();
        s.energy_level = 2;
        let mut hard = task("hard", 2, Some(date(4)));
        hard.effort = Effort::High;
        s.tasks = vec![task("easy", 2, Some(date(4)))];
        assert!(!eval(&LowEnergyRule, &s, &[]).triggered);

        s.tasks.push(hard);
        let result = eval(&LowEnergyRule, &s, &[]);
        assert!(result.triggered);
        assert!(result.requires_escalation);
        assert_eq!(result.direct_recommendation.unwrap().rec_type, RecommendationType::RestBlock);

        s.energy_level = 3;
        assert!(!eval(&LowEnergyRule, &s, &[]).triggered);
    }

    #[test]
    fn test_empty_routine_suggests_habit_for_least_advanced_goal() {
        let mut s = snapshot();
        s.goals = vec![goal("g1", 1, 0.5), goal("g2", 1, 0.1)];
        let result = eval(&EmptyRoutineRule, &s, &[]);
        assert!(result.triggered);
        assert_eq!(result.evidence["anchor_goal_id"], "g2");
        let candidate = result.direct_recommendation.unwrap();
        assert_eq!(candidate.target_kind, TargetKind::Habit);
        assert!(candidate.target_entity_id.is_none());
        assert!(!candidate.action_kind.is_server_executable());

        s.habits = vec![habit("h1", Some(date(4)))];
        assert!(!eval(&EmptyRoutineRule, &s, &[]).triggered);
    }
}
