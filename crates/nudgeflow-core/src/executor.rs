//! Recommendation execution.
//!
//! Accepted recommendations with a server-executable action are turned into
//! an [`EntityCommand`] and dispatched to the [`EntityCommands`] collaborator.
//! Client-deferred actions are handed back as a form pre-fill without any
//! write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::recommendation::{ActionKind, LifecycleManager, Recommendation, RecommendationStatus, TargetKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskCommand {
    pub title: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub estimated_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleTaskCommand {
    pub task_id: String,
    pub new_due_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateHabitCommand {
    pub title: String,
    #[serde(default)]
    pub goal_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseHabitCommand {
    pub habit_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExperimentCommand {
    pub title: String,
    #[serde(default)]
    pub hypothesis: Option<String>,
    #[serde(default)]
    pub duration_days: Option<u32>,
}

/// A write request for the entity services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityCommand {
    CreateTask(CreateTaskCommand),
    RescheduleTask(RescheduleTaskCommand),
    CreateHabit(CreateHabitCommand),
    PauseHabit(PauseHabitCommand),
    StartExperiment(StartExperimentCommand),
}

impl EntityCommand {
    /// Kind of entity the command creates or changes.
    pub fn entity_kind(&self) -> TargetKind {
        match self {
            EntityCommand::CreateTask(_) | EntityCommand::RescheduleTask(_) => TargetKind::Task,
            EntityCommand::CreateHabit(_) | EntityCommand::PauseHabit(_) => TargetKind::Habit,
            EntityCommand::StartExperiment(_) => TargetKind::Experiment,
        }
    }

    /// Build the command for a recommendation's action. Payload fields win;
    /// missing ones are filled from the recommendation itself.
    pub fn for_recommendation(rec: &Recommendation) -> std::result::Result<Self, CommandError> {
        let payload = rec.action_payload.clone().unwrap_or(serde_json::Value::Null);
        let text = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let title = text("title").unwrap_or_else(|| rec.title.clone());
        let target_id = || {
            rec.target_entity_id
                .clone()
                .ok_or_else(|| CommandError::InvalidPayload(format!("{} needs a target entity", rec.action_kind.as_str())))
        };

        let command = match rec.action_kind {
            ActionKind::CreateTask => EntityCommand::CreateTask(CreateTaskCommand {
                title,
                due_date: parse_field(&payload, "due_date")?,
                estimated_minutes: parse_field(&payload, "estimated_minutes")?,
            }),
            ActionKind::RescheduleTask => EntityCommand::RescheduleTask(RescheduleTaskCommand {
                task_id: match text("task_id") {
                    Some(id) => id,
                    None => target_id()?,
                },
                new_due_date: parse_field(&payload, "new_due_date")?
                    .ok_or_else(|| CommandError::InvalidPayload("new_due_date is required".into()))?,
            }),
            ActionKind::CreateHabit => EntityCommand::CreateHabit(CreateHabitCommand {
                title,
                goal_id: text("goal_id"),
            }),
            ActionKind::PauseHabit => EntityCommand::PauseHabit(PauseHabitCommand {
                habit_id: match text("habit_id") {
                    Some(id) => id,
                    None => target_id()?,
                },
            }),
            ActionKind::StartExperiment => EntityCommand::StartExperiment(StartExperimentCommand {
                title,
                hypothesis: text("hypothesis"),
                duration_days: parse_field(&payload, "duration_days")?,
            }),
            other => {
                return Err(CommandError::InvalidPayload(format!(
                    "{} is not server-executable",
                    other.as_str()
                )))
            }
        };
        Ok(command)
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
    key: &str,
) -> std::result::Result<Option<T>, CommandError> {
    match payload.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| CommandError::InvalidPayload(format!("{key}: {e}"))),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("invalid action payload: {0}")]
    InvalidPayload(String),

    #[error("entity '{0}' not found")]
    NotFound(String),

    #[error("entity service failed: {0}")]
    Failed(String),
}

/// Write surface of the goal/task/habit services. Each call returns the id
/// of the created or changed entity.
#[async_trait]
pub trait EntityCommands: Send + Sync {
    async fn create_task(&self, user_id: &str, command: &CreateTaskCommand) -> std::result::Result<String, CommandError>;

    async fn reschedule_task(
        &self,
        user_id: &str,
        command: &RescheduleTaskCommand,
    ) -> std::result::Result<String, CommandError>;

    async fn create_habit(&self, user_id: &str, command: &CreateHabitCommand) -> std::result::Result<String, CommandError>;

    async fn pause_habit(&self, user_id: &str, command: &PauseHabitCommand) -> std::result::Result<String, CommandError>;

    async fn start_experiment(
        &self,
        user_id: &str,
        command: &StartExperimentCommand,
    ) -> std::result::Result<String, CommandError>;
}

/// Outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub recommendation_id: String,
    pub entity_id: Option<String>,
    pub entity_kind: Option<TargetKind>,
    pub success: bool,
    pub error_message: Option<String>,
    pub action_kind: ActionKind,
    pub action_payload: Option<serde_json::Value>,
    pub target_kind: TargetKind,
    pub target_entity_id: Option<String>,
    /// The client must open a form or prompt; nothing was written.
    pub requires_client_action: bool,
}

impl ExecutionResult {
    fn for_recommendation(rec: &Recommendation) -> Self {
        Self {
            recommendation_id: rec.id.clone(),
            entity_id: None,
            entity_kind: None,
            success: false,
            error_message: None,
            action_kind: rec.action_kind,
            action_payload: rec.action_payload.clone(),
            target_kind: rec.target_kind,
            target_entity_id: rec.target_entity_id.clone(),
            requires_client_action: false,
        }
    }
}

/// Runs accepted recommendations against the entity services.
#[derive(Clone)]
pub struct Executor {
    lifecycle: LifecycleManager,
    commands: Arc<dyn EntityCommands>,
    in_flight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Executor {
    pub fn new(lifecycle: LifecycleManager, commands: Arc<dyn EntityCommands>) -> Self {
        Self {
            lifecycle,
            commands,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn claim(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, id: &str, claim: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        drop(claim);
        if in_flight.get(id).is_some_and(|c| Arc::strong_count(c) == 1) {
            in_flight.remove(id);
        }
    }

    async fn dispatch(&self, user_id: &str, command: &EntityCommand) -> std::result::Result<String, CommandError> {
        match command {
            EntityCommand::CreateTask(c) => self.commands.create_task(user_id, c).await,
            EntityCommand::RescheduleTask(c) => self.commands.reschedule_task(user_id, c).await,
            EntityCommand::CreateHabit(c) => self.commands.create_habit(user_id, c).await,
            EntityCommand::PauseHabit(c) => self.commands.pause_habit(user_id, c).await,
            EntityCommand::StartExperiment(c) => self.commands.start_experiment(user_id, c).await,
        }
    }

    /// Execute an Accepted recommendation.
    ///
    /// # Errors
    /// `AlreadyExecuted` for Executed records and `InvalidTransition` for any
    /// other non-Accepted status. Collaborator failures are not errors: they
    /// come back as an unsuccessful result and the record stays Accepted.
    ///
    /// Executions of one recommendation are serialized, and the status is
    /// read under that claim, so a concurrent caller sees `AlreadyExecuted`
    /// instead of dispatching the command a second time.
    pub async fn execute(&self, id: &str, now: DateTime<Utc>) -> Result<ExecutionResult> {
        let claim = self.claim(id);
        let result = {
            let _held = claim.lock().await;
            self.execute_claimed(id, now).await
        };
        self.release(id, claim);
        result
    }

    async fn execute_claimed(&self, id: &str, now: DateTime<Utc>) -> Result<ExecutionResult> {
        let rec = self.lifecycle.get(id)?;
        match rec.status {
            RecommendationStatus::Accepted => {}
            RecommendationStatus::Executed => return Err(LifecycleError::AlreadyExecuted(rec.id).into()),
            other => {
                return Err(LifecycleError::InvalidTransition {
                    id: rec.id,
                    from: other,
                    action: "execute",
                }
                .into())
            }
        }

        let mut result = ExecutionResult::for_recommendation(&rec);
        if !rec.action_kind.is_server_executable() {
            result.success = true;
            result.requires_client_action = true;
            return Ok(result);
        }

        let outcome = match EntityCommand::for_recommendation(&rec) {
            Ok(command) => {
                result.entity_kind = Some(command.entity_kind());
                self.dispatch(&rec.user_id, &command).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(entity_id) => {
                self.lifecycle.mark_executed(&rec.id, Some(entity_id.clone()), now)?;
                tracing::info!(recommendation_id = %rec.id, entity_id = %entity_id, "executed recommendation");
                result.success = true;
                result.entity_id = Some(entity_id);
            }
            Err(e) => {
                tracing::warn!(recommendation_id = %rec.id, error = %e, "execution failed, recommendation stays accepted");
                result.error_message = Some(e.to_string());
            }
        }
        Ok(result)
    }
}

/// Entity services stand-in that records every command it receives.
///
/// Used by the CLI to emit execution requests and by tests.
#[derive(Default)]
pub struct RecordingCommands {
    issued: Mutex<Vec<(String, EntityCommand)>>,
    fail_with: Option<CommandError>,
}

impl RecordingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that rejects every command.
    pub fn failing(error: CommandError) -> Self {
        Self {
            issued: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    /// Commands received so far, with the user they were issued for.
    pub fn issued(&self) -> Vec<(String, EntityCommand)> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, user_id: &str, command: EntityCommand) -> std::result::Result<String, CommandError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        let id = match &command {
            EntityCommand::RescheduleTask(c) => c.task_id.clone(),
            EntityCommand::PauseHabit(c) => c.habit_id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((user_id.to_string(), command));
        Ok(id)
    }
}

#[async_trait]
impl EntityCommands for RecordingCommands {
    async fn create_task(&self, user_id: &str, command: &CreateTaskCommand) -> std::result::Result<String, CommandError> {
        self.record(user_id, EntityCommand::CreateTask(command.clone()))
    }

    async fn reschedule_task(
        &self,
        user_id: &str,
        command: &RescheduleTaskCommand,
    ) -> std::result::Result<String, CommandError> {
        self.record(user_id, EntityCommand::RescheduleTask(command.clone()))
    }

    async fn create_habit(&self, user_id: &str, command: &CreateHabitCommand) -> std::result::Result<String, CommandError> {
        self.record(user_id, EntityCommand::CreateHabit(command.clone()))
    }

    async fn pause_habit(&self, user_id: &str, command: &PauseHabitCommand) -> std::result::Result<String, CommandError> {
        self.record(user_id, EntityCommand::PauseHabit(command.clone()))
    }

    async fn start_experiment(
        &self,
        user_id: &str,
        command: &StartExperimentCommand,
    ) -> std::result::Result<String, CommandError> {
        self.record(user_id, EntityCommand::StartExperiment(command.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::recommendation::{
        DirectRecommendationCandidate, LifecycleConfig, MaterializeOutcome, RecommendationContext, RecommendationType,
    };
    use crate::storage::Store;

    fn setup(commands: Arc<dyn EntityCommands>) -> (LifecycleManager, Executor) {
        let lifecycle = LifecycleManager::new(Arc::new(Store::open_in_memory().unwrap()), LifecycleConfig::default());
        let executor = Executor::new(lifecycle.clone(), commands);
        (lifecycle, executor)
    }

    fn materialize(lifecycle: &LifecycleManager, action_kind: ActionKind, payload: Option<serde_json::Value>) -> Recommendation {
        let candidate = DirectRecommendationCandidate {
            rec_type: RecommendationType::RescheduleTask,
            context: RecommendationContext::DailyPlan,
            target_kind: TargetKind::Task,
            target_entity_id: Some("t1".into()),
            target_entity_title: None,
            action_kind,
            title: "Move it".into(),
            rationale: "Overdue".into(),
            score: 0.7,
            action_payload: payload,
            action_summary: None,
        };
        match lifecycle.materialize("u1", &candidate, Utc::now()).unwrap() {
            MaterializeOutcome::Created(rec) | MaterializeOutcome::Merged(rec) => rec,
            MaterializeOutcome::SkippedAtCapacity => panic!("unexpected cap"),
        }
    }

    /// Delays every command before handing it to the recorder.
    struct SlowCommands {
        inner: Arc<RecordingCommands>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl EntityCommands for SlowCommands {
        async fn create_task(&self, user_id: &str, command: &CreateTaskCommand) -> std::result::Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create_task(user_id, command).await
        }
        async fn reschedule_task(
            &self,
            user_id: &str,
            command: &RescheduleTaskCommand,
        ) -> std::result::Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            self.inner.reschedule_task(user_id, command).await
        }
        async fn create_habit(&self, user_id: &str, command: &CreateHabitCommand) -> std::result::Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            self.inner.create_habit(user_id, command).await
        }
        async fn pause_habit(&self, user_id: &str, command: &PauseHabitCommand) -> std::result::Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            self.inner.pause_habit(user_id, command).await
        }
        async fn start_experiment(
            &self,
            user_id: &str,
            command: &StartExperimentCommand,
        ) -> std::result::Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            self.inner.start_experiment(user_id, command).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_executions_dispatch_once() {
        let recorder = Arc::new(RecordingCommands::new());
        let slow = SlowCommands {
            inner: recorder.clone(),
            delay: std::time::Duration::from_millis(100),
        };
        let (lifecycle, executor) = setup(Arc::new(slow));
        let rec = materialize(
            &lifecycle,
            ActionKind::RescheduleTask,
            Some(serde_json::json!({"new_due_date": "2026-03-05"})),
        );
        lifecycle.accept(&rec.id, Utc::now()).unwrap();

        let retry = executor.clone();
        let (a, b) = tokio::join!(executor.execute(&rec.id, Utc::now()), retry.execute(&rec.id, Utc::now()));

        assert_eq!(recorder.issued().len(), 1);
        let (done, refused) = if a.is_ok() { (a, b) } else { (b, a) };
        assert!(done.unwrap().success);
        assert!(matches!(
            refused.unwrap_err(),
            CoreError::Lifecycle(LifecycleError::AlreadyExecuted(_))
        ));
        assert!(executor.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_server_action_executes_once() {
        let commands = Arc::new(RecordingCommands::new());
        let (lifecycle, executor) = setup(commands.clone());
        let rec = materialize(
            &lifecycle,
            ActionKind::RescheduleTask,
            Some(serde_json::json!({"new_due_date": "2026-03-05"})),
        );
        lifecycle.accept(&rec.id, Utc::now()).unwrap();

        let result = executor.execute(&rec.id, Utc::now()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.entity_id.as_deref(), Some("t1"));
        assert_eq!(result.entity_kind, Some(TargetKind::Task));

        let stored = lifecycle.get(&rec.id).unwrap();
        assert_eq!(stored.status, RecommendationStatus::Executed);
        assert_eq!(stored.executed_entity_id.as_deref(), Some("t1"));
        assert_eq!(commands.issued().len(), 1);

        let again = executor.execute(&rec.id, Utc::now()).await.unwrap_err();
        assert!(matches!(again, CoreError::Lifecycle(LifecycleError::AlreadyExecuted(_))));
        assert_eq!(commands.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_active_recommendation_is_not_executed() {
        let (lifecycle, executor) = setup(Arc::new(RecordingCommands::new()));
        let rec = materialize(&lifecycle, ActionKind::CreateTask, None);

        let err = executor.execute(&rec.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Lifecycle(LifecycleError::InvalidTransition { from: RecommendationStatus::Active, .. })
        ));
    }

    #[tokio::test]
    async fn test_client_deferred_action_writes_nothing() {
        let commands = Arc::new(RecordingCommands::new());
        let (lifecycle, executor) = setup(commands.clone());
        let rec = materialize(&lifecycle, ActionKind::OpenTaskForm, None);
        lifecycle.accept(&rec.id, Utc::now()).unwrap();

        let result = executor.execute(&rec.id, Utc::now()).await.unwrap();
        assert!(result.requires_client_action);
        assert!(commands.issued().is_empty());
        assert_eq!(lifecycle.get(&rec.id).unwrap().status, RecommendationStatus::Accepted);
    }

    #[tokio::test]
    async fn test_failed_command_keeps_recommendation_accepted() {
        let commands = Arc::new(RecordingCommands::failing(CommandError::Failed("503".into())));
        let (lifecycle, executor) = setup(commands);
        let rec = materialize(&lifecycle, ActionKind::CreateTask, None);
        lifecycle.accept(&rec.id, Utc::now()).unwrap();

        let result = executor.execute(&rec.id, Utc::now()).await.unwrap();
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("503"));
        assert_eq!(lifecycle.get(&rec.id).unwrap().status, RecommendationStatus::Accepted);
    }

    #[test]
    fn test_command_built_from_payload_and_record() {
        let (lifecycle, _) = setup(Arc::new(RecordingCommands::new()));
        let rec = materialize(
            &lifecycle,
            ActionKind::CreateTask,
            Some(serde_json::json!({"title": "Recovery block", "estimated_minutes": 30})),
        );
        let command = EntityCommand::for_recommendation(&rec).unwrap();
        assert_eq!(
            command,
            EntityCommand::CreateTask(CreateTaskCommand {
                title: "Recovery block".into(),
                due_date: None,
                estimated_minutes: Some(30),
            })
        );

        let missing_date = materialize(&lifecycle, ActionKind::RescheduleTask, None);
        // Same target, so the previous record was merged in place.
        assert_eq!(missing_date.id, rec.id);
        assert!(matches!(
            EntityCommand::for_recommendation(&missing_date),
            Err(CommandError::InvalidPayload(_))
        ));
    }
}
