//! Tier-N selection seam.
//!
//! A [`TierSelector`] picks an intervention for a situation the rules could
//! only detect. Implementations may be slow and non-deterministic (a model
//! call); the controller bounds every call with a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::context::ContextKey;
use crate::recommendation::{DirectRecommendationCandidate, RecommendationType, TargetKind};
use crate::snapshot::UserStateSnapshot;

/// Input handed to a selector.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub rule_id: String,
    pub evidence: BTreeMap<String, serde_json::Value>,
    pub snapshot: Arc<UserStateSnapshot>,
    /// Interventions the selector may choose from.
    pub candidate_pool: Vec<DirectRecommendationCandidate>,
    pub context_key: ContextKey,
}

impl SelectionRequest {
    /// Target named in the evidence, if any.
    pub fn evidence_target(&self) -> Option<(TargetKind, Option<&str>)> {
        evidence_target(&self.evidence)
    }
}

/// `target_kind`/`target_entity_id` evidence keys as a typed target.
pub(crate) fn evidence_target(evidence: &BTreeMap<String, serde_json::Value>) -> Option<(TargetKind, Option<&str>)> {
    let kind = evidence.get("target_kind")?.as_str()?.parse().ok()?;
    let id = evidence.get("target_entity_id").and_then(|v| v.as_str());
    Some((kind, id))
}

/// Result of one selector invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    /// Best first.
    pub candidates: Vec<DirectRecommendationCandidate>,
    pub tier: u8,
    pub duration_ms: u64,
    pub token_usage: Option<u64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("selector unavailable: {0}")]
    Unavailable(String),

    #[error("selector returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// A pluggable higher-tier selection mechanism.
#[async_trait]
pub trait TierSelector: Send + Sync {
    /// Tier recorded when this selector is invoked.
    fn tier(&self) -> u8 {
        2
    }

    async fn select(&self, request: SelectionRequest) -> Result<SelectionOutcome, SelectorError>;
}

/// Interventions that usually fit a target kind, most fitting first.
pub fn affinity(kind: TargetKind) -> &'static [RecommendationType] {
    match kind {
        TargetKind::Goal => &[
            RecommendationType::ReviewGoal,
            RecommendationType::StartHabit,
            RecommendationType::StartExperiment,
        ],
        TargetKind::Habit => &[RecommendationType::RestartHabit, RecommendationType::StartExperiment],
        TargetKind::Task => &[RecommendationType::BreakDownTask, RecommendationType::RescheduleTask],
        TargetKind::Experiment => &[RecommendationType::StartExperiment, RecommendationType::ReviewGoal],
        TargetKind::General => &[
            RecommendationType::RestBlock,
            RecommendationType::ReduceLoad,
            RecommendationType::StartExperiment,
        ],
    }
}

/// Deterministic tier-2 selector that ranks the offered pool.
///
/// Candidates aimed at the evidence target come first, then interventions
/// with a better affinity for the target kind, then the pool score.
#[derive(Debug, Clone, Default)]
pub struct PoolRankingSelector;

impl PoolRankingSelector {
    pub fn new() -> Self {
        Self
    }

    fn rank_key(
        candidate: &DirectRecommendationCandidate,
        target: Option<(TargetKind, Option<&str>)>,
    ) -> (bool, usize) {
        let on_target = target.is_some_and(|(kind, id)| {
            candidate.target_kind == kind && candidate.target_entity_id.as_deref() == id
        });
        let preferred = affinity(candidate.target_kind);
        let affinity_rank = preferred
            .iter()
            .position(|t| *t == candidate.rec_type)
            .unwrap_or(preferred.len());
        (on_target, affinity_rank)
    }
}

#[async_trait]
impl TierSelector for PoolRankingSelector {
    async fn select(&self, request: SelectionRequest) -> Result<SelectionOutcome, SelectorError> {
        let started = Instant::now();
        if request.candidate_pool.is_empty() {
            return Err(SelectorError::InvalidResponse("empty candidate pool".into()));
        }

        let target = request.evidence_target();
        let mut ranked = request.candidate_pool.clone();
        ranked.sort_by(|a, b| {
            let (a_on, a_aff) = Self::rank_key(a, target);
            let (b_on, b_aff) = Self::rank_key(b, target);
            b_on.cmp(&a_on)
                .then(a_aff.cmp(&b_aff))
                .then(b.score.total_cmp(&a.score))
        });

        Ok(SelectionOutcome {
            candidates: ranked,
            tier: self.tier(),
            duration_ms: started.elapsed().as_millis() as u64,
            token_usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BucketThresholds, ContextKey};
    use crate::recommendation::{ActionKind, RecommendationContext};
    use chrono::Utc;

    fn offer(rec_type: RecommendationType, kind: TargetKind, id: Option<&str>, score: f64) -> DirectRecommendationCandidate {
        DirectRecommendationCandidate {
            rec_type,
            context: RecommendationContext::WeeklyReview,
            target_kind: kind,
            target_entity_id: id.map(str::to_string),
            target_entity_title: None,
            action_kind: ActionKind::Reflect,
            title: rec_type.headline().to_string(),
            rationale: String::new(),
            score,
            action_payload: None,
            action_summary: None,
        }
    }

    fn request(pool: Vec<DirectRecommendationCandidate>) -> SelectionRequest {
        let snapshot = Arc::new(UserStateSnapshot::new("u1", Utc::now()));
        let mut evidence = BTreeMap::new();
        evidence.insert("target_kind".to_string(), serde_json::json!("goal"));
        evidence.insert("target_entity_id".to_string(), serde_json::json!("g1"));
        SelectionRequest {
            rule_id: "stalled-goal".into(),
            evidence,
            context_key: ContextKey::from_snapshot(&BucketThresholds::default(), &snapshot),
            snapshot,
            candidate_pool: pool,
        }
    }

    #[tokio::test]
    async fn test_pool_ranking_prefers_evidence_target_then_affinity() {
        let pool = vec![
            offer(RecommendationType::RestBlock, TargetKind::General, None, 0.9),
            offer(RecommendationType::StartExperiment, TargetKind::Goal, Some("g1"), 0.5),
            offer(RecommendationType::ReviewGoal, TargetKind::Goal, Some("g1"), 0.5),
        ];
        let outcome = PoolRankingSelector::new().select(request(pool)).await.unwrap();

        assert_eq!(outcome.tier, 2);
        assert_eq!(outcome.candidates[0].rec_type, RecommendationType::ReviewGoal);
        assert_eq!(outcome.candidates[2].rec_type, RecommendationType::RestBlock);
        assert!(outcome.token_usage.is_none());
    }

    #[tokio::test]
    async fn test_empty_pool_is_an_error() {
        let err = PoolRankingSelector::new().select(request(Vec::new())).await.unwrap_err();
        assert!(matches!(err, SelectorError::InvalidResponse(_)));
    }
}
