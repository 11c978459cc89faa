//! Per-decision tier selection and final candidate ranking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::selector::{affinity, evidence_target, SelectionRequest, TierSelector};
use crate::context::ContextKey;
use crate::playbook::{Playbook, PlaybookEntry};
use crate::recommendation::{
    DirectRecommendationCandidate, RecommendationContext, RecommendationType, TargetKind,
};
use crate::rules::{RuleResult, Severity};
use crate::snapshot::UserStateSnapshot;
use crate::trace::{AgentRunUsage, SelectionMethod};

/// Selection budgets and output limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Budget for one tier-N selector call.
    #[serde(default = "default_selector_timeout_ms")]
    pub selector_timeout_ms: u64,
    /// Budget for a whole pipeline run.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    /// Maximum ranked candidates per context from one run.
    #[serde(default = "default_per_context_cap")]
    pub per_context_cap: usize,
}

fn default_selector_timeout_ms() -> u64 {
    2_000
}
fn default_run_timeout_ms() -> u64 {
    10_000
}
fn default_per_context_cap() -> usize {
    3
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            selector_timeout_ms: default_selector_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            per_context_cap: default_per_context_cap(),
        }
    }
}

/// How one triggered rule result was resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub rule_id: String,
    pub rule_priority: u32,
    pub severity: Severity,
    pub candidate: Option<DirectRecommendationCandidate>,
    pub method: SelectionMethod,
    pub final_tier: u8,
    pub duration_ms: u64,
    pub agent_runs: Vec<AgentRunUsage>,
}

/// A candidate that survived merging, with its tie-break attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub candidate: DirectRecommendationCandidate,
    pub rule_id: String,
    pub severity: Severity,
    pub rule_priority: u32,
}

type TargetKey = (RecommendationContext, TargetKind, Option<String>);

fn owned_target_key(candidate: &DirectRecommendationCandidate) -> TargetKey {
    (candidate.context, candidate.target_kind, candidate.target_entity_id.clone())
}

/// Resolves rule results into candidates through the tier ladder.
pub struct EscalationController {
    playbook: Playbook,
    selector: Arc<dyn TierSelector>,
    selector_timeout: Duration,
    per_context_cap: usize,
}

impl EscalationController {
    pub fn new(playbook: Playbook, selector: Arc<dyn TierSelector>, config: &SelectionConfig) -> Self {
        Self {
            playbook,
            selector,
            selector_timeout: Duration::from_millis(config.selector_timeout_ms),
            per_context_cap: config.per_context_cap,
        }
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    /// Resolve every triggered result, in order. Non-triggered results are ignored.
    ///
    /// Selector calls share `deadline`: once it passes, the remaining
    /// escalations fall back without calling the selector.
    pub async fn resolve(
        &self,
        results: &[RuleResult],
        snapshot: &Arc<UserStateSnapshot>,
        key: &ContextKey,
        context: RecommendationContext,
        deadline: Instant,
    ) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for result in results.iter().filter(|r| r.triggered) {
            decisions.push(self.decide(result, snapshot, key, context, deadline).await);
        }
        decisions
    }

    /// Walk the tier ladder for one triggered result.
    ///
    /// The selector gets the smaller of its own timeout and what is left
    /// before `deadline`.
    pub async fn decide(
        &self,
        result: &RuleResult,
        snapshot: &Arc<UserStateSnapshot>,
        key: &ContextKey,
        context: RecommendationContext,
        deadline: Instant,
    ) -> Decision {
        let started = Instant::now();
        let decision = |candidate, method, final_tier, agent_runs| Decision {
            rule_id: result.rule_id.clone(),
            rule_priority: result.rule_priority,
            severity: result.severity,
            candidate,
            method,
            final_tier,
            duration_ms: started.elapsed().as_millis() as u64,
            agent_runs,
        };

        if !result.requires_escalation {
            return decision(result.direct_recommendation.clone(), SelectionMethod::Deterministic, 0, Vec::new());
        }

        if let Some(entry) = self.playbook.lookup(key) {
            tracing::debug!(rule_id = %result.rule_id, context_key = %key, intervention = %entry.intervention_type, "playbook hit");
            let candidate = synthesize(result, context, entry.intervention_type, entry.success_rate());
            return decision(Some(candidate), SelectionMethod::PlaybookLookup, 1, Vec::new());
        }

        let budget = self
            .selector_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let (reason, agent_runs) = if budget.is_zero() {
            ("run budget exhausted before selection".to_string(), Vec::new())
        } else {
            match self.select_within(result, snapshot, key, context, budget).await {
                Ok((candidate, tier, usage)) => {
                    return decision(Some(candidate), SelectionMethod::Escalated, tier, vec![usage]);
                }
                Err((reason, usage)) => (reason, vec![usage]),
            }
        };

        tracing::warn!(rule_id = %result.rule_id, reason = %reason, "tier selection failed, falling back");

        let (candidate, tier) = match (&result.direct_recommendation, self.playbook.best_effort(key)) {
            (Some(direct), _) => (Some(direct.clone()), 0),
            (None, Some(entry)) => (Some(synthesize(result, context, entry.intervention_type, entry.success_rate())), 1),
            (None, None) => (None, 0),
        };
        decision(candidate, SelectionMethod::Fallback, tier, agent_runs)
    }

    /// One selector call bounded by `budget`. Errors carry the failure
    /// reason and the usage of the attempt.
    async fn select_within(
        &self,
        result: &RuleResult,
        snapshot: &Arc<UserStateSnapshot>,
        key: &ContextKey,
        context: RecommendationContext,
        budget: Duration,
    ) -> Result<(DirectRecommendationCandidate, u8, AgentRunUsage), (String, AgentRunUsage)> {
        let request = SelectionRequest {
            rule_id: result.rule_id.clone(),
            evidence: result.evidence.clone(),
            snapshot: Arc::clone(snapshot),
            candidate_pool: self.candidate_pool(result, key, context),
            context_key: *key,
        };

        let call_started = Instant::now();
        match tokio::time::timeout(budget, self.selector.select(request)).await {
            Ok(Ok(outcome)) => {
                let usage = AgentRunUsage {
                    tokens: outcome.token_usage.unwrap_or(0),
                    duration_ms: outcome.duration_ms,
                    tier: outcome.tier,
                };
                match outcome.candidates.into_iter().next() {
                    Some(mut candidate) => {
                        candidate.context = context;
                        Ok((candidate, outcome.tier, usage))
                    }
                    None => Err(("selector returned no candidates".to_string(), usage)),
                }
            }
            Ok(Err(e)) => Err((e.to_string(), self.attempt_usage(call_started))),
            Err(_) => Err((
                format!("selector timed out after {} ms", budget.as_millis()),
                self.attempt_usage(call_started),
            )),
        }
    }

    fn attempt_usage(&self, call_started: Instant) -> AgentRunUsage {
        AgentRunUsage {
            tokens: 0,
            duration_ms: call_started.elapsed().as_millis() as u64,
            tier: self.selector.tier(),
        }
    }

    /// Pool offered to the selector: the rule's fallback candidate, any
    /// intervention the playbook has history for, and the interventions that
    /// suit the target kind.
    fn candidate_pool(
        &self,
        result: &RuleResult,
        key: &ContextKey,
        context: RecommendationContext,
    ) -> Vec<DirectRecommendationCandidate> {
        let mut pool: Vec<DirectRecommendationCandidate> = result.direct_recommendation.iter().cloned().collect();
        let mut offer = |rec_type: RecommendationType, score: f64| {
            if !pool.iter().any(|c| c.rec_type == rec_type) {
                pool.push(synthesize(result, context, rec_type, score));
            }
        };

        if let Some(PlaybookEntry { intervention_type, .. }) = self.playbook.best_effort(key) {
            offer(intervention_type, 0.55);
        }
        for rec_type in affinity(target_of(result).0) {
            offer(*rec_type, 0.5);
        }
        pool
    }

    /// Merge candidates by target, rank them, and cap each context.
    ///
    /// A target keeps its highest-scoring candidate; ties go to the higher
    /// severity, then to the lower rule priority.
    pub fn rank(&self, decisions: &[Decision]) -> Vec<RankedCandidate> {
        let mut best: HashMap<TargetKey, RankedCandidate> = HashMap::new();
        for decision in decisions {
            let Some(candidate) = &decision.candidate else { continue };
            let ranked = RankedCandidate {
                candidate: candidate.clone(),
                rule_id: decision.rule_id.clone(),
                severity: decision.severity,
                rule_priority: decision.rule_priority,
            };
            let target = owned_target_key(candidate);
            if best.get(&target).map_or(true, |current| outranks(&ranked, current)) {
                best.insert(target, ranked);
            }
        }

        let mut ranked: Vec<RankedCandidate> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.candidate
                .score
                .total_cmp(&a.candidate.score)
                .then(b.severity.cmp(&a.severity))
                .then(a.rule_priority.cmp(&b.rule_priority))
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| owned_target_key(&a.candidate).cmp(&owned_target_key(&b.candidate)))
        });

        let mut per_context: HashMap<RecommendationContext, usize> = HashMap::new();
        ranked.retain(|r| {
            let count = per_context.entry(r.candidate.context).or_insert(0);
            *count += 1;
            *count <= self.per_context_cap
        });
        ranked
    }
}

fn outranks(a: &RankedCandidate, b: &RankedCandidate) -> bool {
    a.candidate
        .score
        .total_cmp(&b.candidate.score)
        .then(a.severity.cmp(&b.severity))
        .then(b.rule_priority.cmp(&a.rule_priority))
        .is_gt()
}

/// Target for synthesized candidates: evidence first, then the rule's own
/// candidate, else a general recommendation.
fn target_of(result: &RuleResult) -> (TargetKind, Option<String>, Option<String>) {
    if let Some((kind, id)) = evidence_target(&result.evidence) {
        let title = result
            .evidence
            .get("target_entity_title")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        return (kind, id.map(str::to_string), title);
    }
    match &result.direct_recommendation {
        Some(c) => (c.target_kind, c.target_entity_id.clone(), c.target_entity_title.clone()),
        None => (TargetKind::General, None, None),
    }
}

/// Build a candidate for an intervention type chosen above tier 0.
fn synthesize(
    result: &RuleResult,
    context: RecommendationContext,
    rec_type: RecommendationType,
    score: f64,
) -> DirectRecommendationCandidate {
    let (target_kind, target_entity_id, target_entity_title) = target_of(result);
    let title = match &target_entity_title {
        Some(name) => format!("{}: {name}", rec_type.headline()),
        None => rec_type.headline().to_string(),
    };
    DirectRecommendationCandidate {
        rec_type,
        context,
        target_kind,
        action_payload: Some(serde_json::json!({
            "title": title,
            "target_entity_id": target_entity_id,
        })),
        target_entity_id,
        target_entity_title,
        action_kind: rec_type.default_action(),
        rationale: format!("Flagged by {}.", result.rule_name),
        title,
        score: score.clamp(0.0, 1.0),
        action_summary: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CapacityBucket, DayTypeBucket, LevelBucket};
    use crate::escalation::selector::{PoolRankingSelector, SelectionOutcome, SelectorError};
    use crate::playbook::{InMemoryPlaybook, PlaybookPolicy};
    use crate::recommendation::ActionKind;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn key() -> ContextKey {
        ContextKey::new(LevelBucket::Medium, CapacityBucket::Full, DayTypeBucket::Weekday, LevelBucket::Medium)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn snapshot() -> Arc<UserStateSnapshot> {
        Arc::new(UserStateSnapshot::new("u1", Utc::now()))
    }

    fn direct(rec_type: RecommendationType, id: &str, score: f64) -> DirectRecommendationCandidate {
        DirectRecommendationCandidate {
            rec_type,
            context: RecommendationContext::DailyPlan,
            target_kind: TargetKind::Task,
            target_entity_id: Some(id.to_string()),
            target_entity_title: None,
            action_kind: ActionKind::RescheduleTask,
            title: "t".into(),
            rationale: "r".into(),
            score,
            action_payload: None,
            action_summary: None,
        }
    }

    fn result(rule_id: &str, priority: u32, severity: Severity) -> RuleResult {
        RuleResult {
            rule_id: rule_id.to_string(),
            rule_name: rule_id.to_string(),
            rule_priority: priority,
            triggered: true,
            severity,
            evidence: BTreeMap::new(),
            direct_recommendation: None,
            requires_escalation: false,
        }
    }

    fn stalled_goal() -> RuleResult {
        let mut r = result("stalled-goal", 40, Severity::Warning);
        r.requires_escalation = true;
        r.evidence.insert("target_kind".into(), "goal".into());
        r.evidence.insert("target_entity_id".into(), "g1".into());
        r.evidence.insert("target_entity_title".into(), "Run a marathon".into());
        r
    }

    fn controller(playbook: Arc<InMemoryPlaybook>, selector: Arc<dyn TierSelector>, timeout_ms: u64) -> EscalationController {
        let config = SelectionConfig {
            selector_timeout_ms: timeout_ms,
            ..SelectionConfig::default()
        };
        EscalationController::new(Playbook::new(playbook, PlaybookPolicy::default()), selector, &config)
    }

    struct Sleepy;

    #[async_trait]
    impl TierSelector for Sleepy {
        fn tier(&self) -> u8 {
            3
        }
        async fn select(&self, _request: SelectionRequest) -> Result<SelectionOutcome, SelectorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(SelectorError::Unavailable("never".into()))
        }
    }

    struct Broken;

    #[async_trait]
    impl TierSelector for Broken {
        async fn select(&self, _request: SelectionRequest) -> Result<SelectionOutcome, SelectorError> {
            Err(SelectorError::Unavailable("model offline".into()))
        }
    }

    #[tokio::test]
    async fn test_direct_candidate_is_deterministic_tier_zero() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(PoolRankingSelector), 100);
        let mut r = result("overdue-task", 20, Severity::Warning);
        r.direct_recommendation = Some(direct(RecommendationType::RescheduleTask, "t1", 0.7));

        let d = c.decide(&r, &snapshot(), &key(), RecommendationContext::DailyPlan, later()).await;
        assert_eq!(d.method, SelectionMethod::Deterministic);
        assert_eq!(d.final_tier, 0);
        assert!(d.agent_runs.is_empty());
    }

    #[tokio::test]
    async fn test_attested_playbook_entry_wins_before_selector() {
        let playbook = Arc::new(InMemoryPlaybook::new());
        for i in 0..6 {
            playbook.record_outcome(&key(), RecommendationType::ReviewGoal, i < 5);
        }
        let c = controller(playbook, Arc::new(Broken), 100);

        let d = c.decide(&stalled_goal(), &snapshot(), &key(), RecommendationContext::WeeklyReview, later()).await;
        assert_eq!(d.method, SelectionMethod::PlaybookLookup);
        assert_eq!(d.final_tier, 1);
        let candidate = d.candidate.unwrap();
        assert_eq!(candidate.rec_type, RecommendationType::ReviewGoal);
        assert_eq!(candidate.target_entity_id.as_deref(), Some("g1"));
        assert_eq!(candidate.context, RecommendationContext::WeeklyReview);
    }

    #[tokio::test]
    async fn test_selector_escalation_records_agent_run() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(PoolRankingSelector), 1_000);

        let d = c.decide(&stalled_goal(), &snapshot(), &key(), RecommendationContext::WeeklyReview, later()).await;
        assert_eq!(d.method, SelectionMethod::Escalated);
        assert_eq!(d.final_tier, 2);
        assert_eq!(d.agent_runs.len(), 1);
        assert_eq!(d.candidate.unwrap().rec_type, RecommendationType::ReviewGoal);
    }

    #[tokio::test]
    async fn test_selector_timeout_falls_back_to_rule_candidate() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(Sleepy), 50);
        let mut r = result("low-energy", 50, Severity::Warning);
        r.requires_escalation = true;
        r.direct_recommendation = Some(direct(RecommendationType::RestBlock, "t9", 0.65));

        let started = Instant::now();
        let d = c.decide(&r, &snapshot(), &key(), RecommendationContext::DailyPlan, later()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(d.method, SelectionMethod::Fallback);
        assert_eq!(d.final_tier, 0);
        assert_eq!(d.candidate.unwrap().rec_type, RecommendationType::RestBlock);
        assert_eq!(d.agent_runs.len(), 1);
        assert_eq!(d.agent_runs[0].tier, 3);
    }

    #[tokio::test]
    async fn test_selector_budget_is_clamped_to_run_deadline() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(Sleepy), 5_000);
        let mut r = result("low-energy", 50, Severity::Warning);
        r.requires_escalation = true;
        r.direct_recommendation = Some(direct(RecommendationType::RestBlock, "t9", 0.65));

        let started = Instant::now();
        let deadline = started + Duration::from_millis(80);
        let d = c.decide(&r, &snapshot(), &key(), RecommendationContext::DailyPlan, deadline).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(d.method, SelectionMethod::Fallback);
        assert_eq!(d.candidate.unwrap().rec_type, RecommendationType::RestBlock);
        assert_eq!(d.agent_runs.len(), 1);
    }

    #[tokio::test]
    async fn test_passed_deadline_skips_the_selector() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(Sleepy), 5_000);
        let mut r = result("low-energy", 50, Severity::Warning);
        r.requires_escalation = true;
        r.direct_recommendation = Some(direct(RecommendationType::RestBlock, "t9", 0.65));
        let results = vec![r, stalled_goal()];

        let started = Instant::now();
        let decisions = c
            .resolve(&results, &snapshot(), &key(), RecommendationContext::DailyPlan, started)
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().all(|d| d.method == SelectionMethod::Fallback));
        assert!(decisions.iter().all(|d| d.agent_runs.is_empty()));
        assert_eq!(decisions[0].candidate.as_ref().unwrap().rec_type, RecommendationType::RestBlock);
        assert!(decisions[1].candidate.is_none());
    }

    #[tokio::test]
    async fn test_fallback_uses_best_effort_playbook_then_nothing() {
        let playbook = Arc::new(InMemoryPlaybook::new());
        let c = controller(playbook.clone(), Arc::new(Broken), 100);

        let d = c.decide(&stalled_goal(), &snapshot(), &key(), RecommendationContext::WeeklyReview, later()).await;
        assert_eq!(d.method, SelectionMethod::Fallback);
        assert!(d.candidate.is_none());

        playbook.record_outcome(&key(), RecommendationType::StartHabit, true);
        let d = c.decide(&stalled_goal(), &snapshot(), &key(), RecommendationContext::WeeklyReview, later()).await;
        assert_eq!(d.method, SelectionMethod::Fallback);
        assert_eq!(d.final_tier, 1);
        assert_eq!(d.candidate.unwrap().rec_type, RecommendationType::StartHabit);
    }

    fn decision(rule_id: &str, priority: u32, severity: Severity, candidate: DirectRecommendationCandidate) -> Decision {
        Decision {
            rule_id: rule_id.to_string(),
            rule_priority: priority,
            severity,
            candidate: Some(candidate),
            method: SelectionMethod::Deterministic,
            final_tier: 0,
            duration_ms: 0,
            agent_runs: Vec::new(),
        }
    }

    #[test]
    fn test_rank_merges_by_target_and_caps_per_context() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(PoolRankingSelector), 100);
        let decisions = vec![
            decision("overdue-task", 20, Severity::Warning, direct(RecommendationType::RescheduleTask, "t1", 0.7)),
            decision("capacity-overload", 10, Severity::Critical, direct(RecommendationType::RescheduleTask, "t1", 0.9)),
            decision("a", 30, Severity::Info, direct(RecommendationType::BreakDownTask, "t2", 0.5)),
            decision("b", 30, Severity::Info, direct(RecommendationType::BreakDownTask, "t3", 0.4)),
            decision("c", 30, Severity::Info, direct(RecommendationType::BreakDownTask, "t4", 0.3)),
        ];

        let ranked = c.rank(&decisions);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].rule_id, "capacity-overload");
        assert_eq!(ranked[1].candidate.target_entity_id.as_deref(), Some("t2"));
        assert_eq!(ranked[2].candidate.target_entity_id.as_deref(), Some("t3"));
    }

    #[test]
    fn test_rank_tie_goes_to_severity_then_priority() {
        let c = controller(Arc::new(InMemoryPlaybook::new()), Arc::new(PoolRankingSelector), 100);
        let decisions = vec![
            decision("low", 50, Severity::Warning, direct(RecommendationType::RescheduleTask, "t1", 0.7)),
            decision("severe", 60, Severity::Critical, direct(RecommendationType::BreakDownTask, "t1", 0.7)),
            decision("early", 5, Severity::Critical, direct(RecommendationType::ReduceLoad, "t1", 0.7)),
        ];

        let ranked = c.rank(&decisions);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].rule_id, "early");
    }
}
