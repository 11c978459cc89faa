//! Deterministic rule evaluation.
//!
//! A rule looks at one user-state snapshot plus the run's pending signals and
//! reports whether it fired, why, and optionally what to do about it. Rules
//! that only detect a situation set `requires_escalation` and leave the choice
//! of intervention to the escalation controller.

pub mod builtin;
pub mod engine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::context::{BucketThresholds, ContextKey};
use crate::recommendation::{DirectRecommendationCandidate, RecommendationContext};
use crate::signals::SignalEntry;
use crate::snapshot::UserStateSnapshot;

pub use builtin::builtin_rules;
pub use engine::RuleEngine;

/// How strongly a triggered rule wants attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Rule evaluation failure. The engine turns these into non-triggered results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("missing snapshot data: {0}")]
    MissingData(String),

    #[error("{0}")]
    Evaluation(String),
}

/// Everything a rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub snapshot: &'a UserStateSnapshot,
    /// Unconsumed signals captured at run start, oldest first.
    pub signals: &'a [SignalEntry],
    pub context: RecommendationContext,
    pub thresholds: &'a BucketThresholds,
}

impl<'a> RuleInput<'a> {
    pub fn context_key(&self) -> ContextKey {
        ContextKey::from_snapshot(self.thresholds, self.snapshot)
    }

    /// Pending signals whose source event type is `event_type`.
    pub fn signals_of(&self, event_type: &str) -> Vec<&'a SignalEntry> {
        self.signals
            .iter()
            .filter(|s| s.source_event_type == event_type)
            .collect()
    }
}

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub rule_name: String,
    /// Lower values rank first when candidates tie.
    pub rule_priority: u32,
    pub triggered: bool,
    pub severity: Severity,
    pub evidence: BTreeMap<String, serde_json::Value>,
    pub direct_recommendation: Option<DirectRecommendationCandidate>,
    pub requires_escalation: bool,
}

impl RuleResult {
    /// Result for a rule that did not fire: no evidence, no escalation.
    pub fn not_triggered<R: Rule + ?Sized>(rule: &R) -> Self {
        Self {
            rule_id: rule.id().to_string(),
            rule_name: rule.name().to_string(),
            rule_priority: rule.priority(),
            triggered: false,
            severity: Severity::Info,
            evidence: BTreeMap::new(),
            direct_recommendation: None,
            requires_escalation: false,
        }
    }

    /// Result for a rule that fired. Callers add evidence and an outcome.
    pub fn triggered<R: Rule + ?Sized>(rule: &R, severity: Severity) -> Self {
        Self {
            triggered: true,
            severity,
            ..Self::not_triggered(rule)
        }
    }

    /// Non-triggered result carrying the failure in its `error` evidence.
    pub fn failed<R: Rule + ?Sized>(rule: &R, message: impl Into<String>) -> Self {
        let mut result = Self::not_triggered(rule);
        result
            .evidence
            .insert("error".to_string(), serde_json::Value::String(message.into()));
        result
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    pub fn with_candidate(mut self, candidate: DirectRecommendationCandidate) -> Self {
        self.direct_recommendation = Some(candidate);
        self
    }

    pub fn escalate(mut self) -> Self {
        self.requires_escalation = true;
        self
    }

    pub fn error(&self) -> Option<&str> {
        self.evidence.get("error").and_then(|v| v.as_str())
    }
}

/// A deterministic heuristic over one snapshot.
pub trait Rule: Send + Sync {
    /// Stable identifier, used for configuration and traces.
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    /// Evaluation and tie-break order; lower first.
    fn priority(&self) -> u32;

    fn evaluate(&self, input: &RuleInput<'_>) -> Result<RuleResult, RuleError>;
}
