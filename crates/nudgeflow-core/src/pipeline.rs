//! Pipeline orchestration.
//!
//! One run for one user: capture pending signals, assemble the snapshot,
//! evaluate rules, resolve tiers, rank, then write recommendations, traces
//! and signal consumption in a single transaction. Runs for the same user are
//! serialized; runs for different users proceed concurrently.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::ContextKey;
use crate::error::{CoreError, Result};
use crate::escalation::{EscalationController, PoolRankingSelector, TierSelector};
use crate::events::DomainEvent;
use crate::executor::{EntityCommands, ExecutionResult, Executor};
use crate::playbook::{Playbook, PlaybookReader};
use crate::recommendation::{
    LifecycleManager, MaterializeOutcome, Recommendation, RecommendationContext, TargetKind, WakeReport,
};
use crate::rules::{RuleEngine, RuleInput};
use crate::signals::{DueUser, IngestOutcome, SignalClassifier, SignalEntry, WindowAggregator, WindowType};
use crate::snapshot::{SnapshotAssembler, UserStateSnapshot};
use crate::storage::config::Config;
use crate::storage::signals::mark_signals_consumed;
use crate::storage::traces::insert_trace;
use crate::storage::Store;
use crate::trace::{PageRequest, TraceFilter, TracePage, TraceRecorder};

/// Share of the run budget held back from tier selection for persistence.
fn persist_reserve(run_timeout: Duration) -> Duration {
    (run_timeout / 10).min(Duration::from_millis(250))
}

/// Summary of one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub user_id: String,
    pub context: RecommendationContext,
    pub window: WindowType,
    pub context_key: ContextKey,
    pub signals_consumed: usize,
    pub rules_triggered: usize,
    pub rules_failed: usize,
    pub created: Vec<Recommendation>,
    pub merged: Vec<Recommendation>,
    pub skipped_at_capacity: usize,
    pub trace_ids: Vec<String>,
    pub duration_ms: u64,
}

/// Outcome of one due user in a scheduled sweep.
#[derive(Debug)]
pub struct DueRun {
    pub user_id: String,
    pub window: WindowType,
    pub result: Result<RunReport>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    store: Arc<Store>,
    config: Config,
    snapshots: Arc<dyn SnapshotAssembler>,
    commands: Arc<dyn EntityCommands>,
    selector: Option<Arc<dyn TierSelector>>,
    playbook: Option<Arc<dyn PlaybookReader>>,
    engine: Option<RuleEngine>,
}

impl PipelineBuilder {
    /// Tier-N selector. Defaults to [`PoolRankingSelector`].
    pub fn selector(mut self, selector: Arc<dyn TierSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Playbook source. Defaults to the store's playbook table.
    pub fn playbook(mut self, reader: Arc<dyn PlaybookReader>) -> Self {
        self.playbook = Some(reader);
        self
    }

    /// Rule engine. Defaults to the built-in rules; disabled ids from the
    /// config are applied either way.
    pub fn rules(mut self, engine: RuleEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Pipeline {
        let config = self.config;
        let store = self.store;

        let mut engine = self.engine.unwrap_or_default();
        engine.disable(config.rules.disabled.iter().cloned());

        let reader: Arc<dyn PlaybookReader> = match self.playbook {
            Some(reader) => reader,
            None => store.clone(),
        };
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(PoolRankingSelector::new()));
        let controller = EscalationController::new(
            Playbook::new(reader, config.playbook.clone()),
            selector,
            &config.selection,
        );

        let lifecycle = LifecycleManager::new(store.clone(), config.lifecycle.clone());
        let executor = Executor::new(lifecycle.clone(), self.commands);
        let aggregator = WindowAggregator::new(
            store.clone(),
            SignalClassifier::new(config.classification_table()),
        );

        Pipeline {
            store,
            aggregator,
            engine,
            controller,
            lifecycle,
            executor,
            snapshots: self.snapshots,
            run_timeout: Duration::from_millis(config.selection.run_timeout_ms),
            config,
            user_locks: Mutex::new(HashMap::new()),
        }
    }
}

/// The recommendation decision pipeline.
pub struct Pipeline {
    store: Arc<Store>,
    config: Config,
    aggregator: WindowAggregator,
    engine: RuleEngine,
    controller: EscalationController,
    lifecycle: LifecycleManager,
    executor: Executor,
    snapshots: Arc<dyn SnapshotAssembler>,
    run_timeout: Duration,
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn builder(
        store: Arc<Store>,
        config: Config,
        snapshots: Arc<dyn SnapshotAssembler>,
        commands: Arc<dyn EntityCommands>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            snapshots,
            commands,
            selector: None,
            playbook: None,
            engine: None,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn classifier(&self) -> &SignalClassifier {
        self.aggregator.classifier()
    }

    /// Classify and queue a domain event.
    pub fn ingest(&self, event: &DomainEvent) -> Result<IngestOutcome> {
        self.aggregator.ingest(event)
    }

    /// Users whose windows have closed by `now`.
    pub fn due_users(&self, now: DateTime<Utc>) -> Result<Vec<DueUser>> {
        self.aggregator.due_users(now)
    }

    /// Run the pipeline for one user right away, consuming whatever signals
    /// are pending regardless of their windows.
    pub async fn generate(&self, user_id: &str, context: RecommendationContext) -> Result<RunReport> {
        self.run(user_id, context, WindowType::Immediate).await
    }

    /// Run every user whose window has closed by `now`, concurrently.
    ///
    /// A failed run is reported in its [`DueRun`] and does not affect the
    /// others.
    pub async fn process_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<DueRun>> {
        let due = self.due_users(now)?;
        let mut set = JoinSet::new();
        for user in due {
            let pipeline = Arc::clone(self);
            set.spawn(async move {
                let context = RecommendationContext::for_window(user.window);
                let result = pipeline.run(&user.user_id, context, user.window).await;
                DueRun {
                    user_id: user.user_id,
                    window: user.window,
                    result,
                }
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => tracing::error!(error = %e, "pipeline run task failed to join"),
            }
        }
        runs.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(runs)
    }

    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the user's lock entry once no run holds or waits on it.
    fn release_user_lock(&self, user_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(user_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_users(&self) -> usize {
        self.user_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn run(&self, user_id: &str, context: RecommendationContext, window: WindowType) -> Result<RunReport> {
        let lock = self.user_lock(user_id);
        let result = {
            let _guard = lock.lock().await;
            let deadline = Instant::now() + self.run_timeout.saturating_sub(persist_reserve(self.run_timeout));
            tokio::time::timeout(self.run_timeout, self.run_locked(user_id, context, window, deadline)).await
        };
        self.release_user_lock(user_id, lock);

        match result {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.run_timeout.as_millis() as u64;
                tracing::warn!(user_id, timeout_ms, "pipeline run abandoned, signals left queued");
                Err(CoreError::RunTimedOut {
                    user_id: user_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn run_locked(
        &self,
        user_id: &str,
        context: RecommendationContext,
        window: WindowType,
        deadline: Instant,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let run_started_at = Utc::now();

        let signals: Vec<SignalEntry> = self.aggregator.pending_for(user_id, run_started_at)?;
        let snapshot = self
            .snapshots
            .assemble(user_id)
            .await
            .map_err(|e| CoreError::Snapshot {
                user_id: user_id.to_string(),
                message: e.to_string(),
            })?;
        let snapshot: Arc<UserStateSnapshot> = Arc::new(snapshot);

        let input = RuleInput {
            snapshot: &snapshot,
            signals: &signals,
            context,
            thresholds: &self.config.buckets,
        };
        let key = input.context_key();
        let results = self.engine.evaluate(&input);
        let rules_triggered = results.iter().filter(|r| r.triggered).count();
        let rules_failed = results.iter().filter(|r| r.error().is_some()).count();

        let decisions = self.controller.resolve(&results, &snapshot, &key, context, deadline).await;
        let ranked = self.controller.rank(&decisions);

        let signal_ids: Vec<String> = signals.iter().map(|s| s.id.clone()).collect();
        let now = Utc::now();
        let (outcomes, traces) = self.store.transaction(|tx| {
            let mut outcomes = Vec::with_capacity(ranked.len());
            let mut materialized: HashMap<(TargetKind, Option<String>), String> = HashMap::new();
            for entry in &ranked {
                let outcome = self.lifecycle.materialize_in(tx, user_id, &entry.candidate, now)?;
                if let Some(rec) = outcome.recommendation() {
                    materialized.insert((rec.target_kind, rec.target_entity_id.clone()), rec.id.clone());
                }
                outcomes.push(outcome);
            }

            let mut recorder = TraceRecorder::new(&run_id, user_id, context, window);
            for decision in &decisions {
                let recommendation_id = decision.candidate.as_ref().and_then(|c| {
                    materialized
                        .get(&(c.target_kind, c.target_entity_id.clone()))
                        .cloned()
                });
                recorder.record(
                    &decision.rule_id,
                    recommendation_id,
                    decision.method,
                    decision.final_tier,
                    decision.duration_ms,
                    &decision.agent_runs,
                );
            }
            let traces = recorder.finish();
            for trace in &traces {
                insert_trace(tx, trace)?;
            }

            mark_signals_consumed(tx, &signal_ids, &run_id, now)?;
            Ok((outcomes, traces))
        })?;

        let mut report = RunReport {
            run_id,
            user_id: user_id.to_string(),
            context,
            window,
            context_key: key,
            signals_consumed: signal_ids.len(),
            rules_triggered,
            rules_failed,
            created: Vec::new(),
            merged: Vec::new(),
            skipped_at_capacity: 0,
            trace_ids: traces.into_iter().map(|t| t.id).collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        for outcome in outcomes {
            match outcome {
                MaterializeOutcome::Created(rec) => report.created.push(rec),
                MaterializeOutcome::Merged(rec) => report.merged.push(rec),
                MaterializeOutcome::SkippedAtCapacity => report.skipped_at_capacity += 1,
            }
        }

        tracing::info!(
            run_id = %report.run_id,
            user_id,
            context = %context,
            window = %window,
            signals = report.signals_consumed,
            triggered = report.rules_triggered,
            created = report.created.len(),
            merged = report.merged.len(),
            duration_ms = report.duration_ms,
            "pipeline run complete"
        );
        Ok(report)
    }

    /// Accept a recommendation and execute it. The acceptance stands even
    /// when execution fails; the result says what happened.
    pub async fn accept(&self, id: &str, now: DateTime<Utc>) -> Result<ExecutionResult> {
        self.lifecycle.accept(id, now)?;
        self.executor.execute(id, now).await
    }

    /// Retry execution of an already Accepted recommendation.
    pub async fn execute(&self, id: &str, now: DateTime<Utc>) -> Result<ExecutionResult> {
        self.executor.execute(id, now).await
    }

    pub fn dismiss(&self, id: &str, reason: Option<String>, now: DateTime<Utc>) -> Result<Recommendation> {
        self.lifecycle.dismiss(id, reason, now)
    }

    pub fn snooze(&self, id: &str, until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Recommendation> {
        self.lifecycle.snooze(id, until, now)
    }

    pub fn wake_snoozed(&self, now: DateTime<Utc>) -> Result<WakeReport> {
        self.lifecycle.wake_snoozed(now)
    }

    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        self.lifecycle.expire_stale(now)
    }

    /// Delete consumed signals past the configured retention.
    pub fn purge_consumed_signals(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - ChronoDuration::days(i64::from(self.config.signals.retention_days));
        self.aggregator.purge_consumed(cutoff)
    }

    pub fn list_traces(&self, filter: &TraceFilter, page: PageRequest) -> Result<TracePage> {
        self.store.list_traces(filter, page)
    }
}
