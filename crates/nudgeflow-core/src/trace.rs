//! Per-decision provenance records.
//!
//! Every decision the pipeline makes (one per triggered rule) leaves an
//! append-only [`RecommendationTrace`], with one [`AgentRunStat`] per tier-N
//! selector invocation. Traces are collected in memory during a run by the
//! [`TraceRecorder`] and written in the same transaction as the
//! recommendations they describe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::recommendation::{RecommendationContext, RecommendationStatus};
use crate::signals::WindowType;

/// How the final candidate of a decision was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectionMethod {
    Deterministic,
    PlaybookLookup,
    Escalated,
    Fallback,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Deterministic => "Deterministic",
            SelectionMethod::PlaybookLookup => "PlaybookLookup",
            SelectionMethod::Escalated => "Escalated",
            SelectionMethod::Fallback => "Fallback",
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deterministic" => Ok(SelectionMethod::Deterministic),
            "PlaybookLookup" => Ok(SelectionMethod::PlaybookLookup),
            "Escalated" => Ok(SelectionMethod::Escalated),
            "Fallback" => Ok(SelectionMethod::Fallback),
            other => Err(ValidationError::invalid("selection_method", other)),
        }
    }
}

/// Usage reported by one tier-N selector invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRunStat {
    pub trace_id: String,
    pub tokens: u64,
    pub duration_ms: u64,
    pub tier: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationTrace {
    pub id: String,
    pub run_id: String,
    pub user_id: String,
    pub rule_id: String,
    /// None when the decision produced no recommendation.
    pub recommendation_id: Option<String>,
    pub context: RecommendationContext,
    pub selection_method: SelectionMethod,
    pub final_tier: u8,
    pub processing_window_type: WindowType,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub agent_runs: Vec<AgentRunStat>,
}

/// Selector invocation awaiting its trace id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentRunUsage {
    pub tokens: u64,
    pub duration_ms: u64,
    pub tier: u8,
}

/// Collects the traces of one pipeline run.
#[derive(Debug)]
pub struct TraceRecorder {
    run_id: String,
    user_id: String,
    context: RecommendationContext,
    window: WindowType,
    traces: Vec<RecommendationTrace>,
}

impl TraceRecorder {
    pub fn new(run_id: &str, user_id: &str, context: RecommendationContext, window: WindowType) -> Self {
        Self {
            run_id: run_id.to_string(),
            user_id: user_id.to_string(),
            context,
            window,
            traces: Vec::new(),
        }
    }

    /// Record one decision. Returns the trace id.
    pub fn record(
        &mut self,
        rule_id: &str,
        recommendation_id: Option<String>,
        method: SelectionMethod,
        final_tier: u8,
        duration_ms: u64,
        agent_runs: &[AgentRunUsage],
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let agent_runs = agent_runs
            .iter()
            .map(|usage| AgentRunStat {
                trace_id: id.clone(),
                tokens: usage.tokens,
                duration_ms: usage.duration_ms,
                tier: usage.tier,
            })
            .collect();

        self.traces.push(RecommendationTrace {
            id: id.clone(),
            run_id: self.run_id.clone(),
            user_id: self.user_id.clone(),
            rule_id: rule_id.to_string(),
            recommendation_id,
            context: self.context,
            selection_method: method,
            final_tier,
            processing_window_type: self.window,
            total_duration_ms: duration_ms,
            created_at: Utc::now(),
            agent_runs,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn finish(self) -> Vec<RecommendationTrace> {
        self.traces
    }
}

/// Filters for the administrative trace listing. Empty filter = all traces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub context: Option<RecommendationContext>,
    /// Status of the linked recommendation.
    pub status: Option<RecommendationStatus>,
    pub user_id: Option<String>,
    pub selection_method: Option<SelectionMethod>,
    pub final_tier: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: u32 = 200;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// One listing row: the trace plus aggregate agent-run stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub trace: RecommendationTrace,
    pub recommendation_status: Option<RecommendationStatus>,
    pub agent_run_count: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePage {
    pub rows: Vec<TraceRow>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_links_agent_runs_to_trace() {
        let mut recorder = TraceRecorder::new("run-1", "u1", RecommendationContext::DailyPlan, WindowType::DailyWindow);
        let usage = [AgentRunUsage { tokens: 420, duration_ms: 900, tier: 2 }];
        let trace_id = recorder.record("stalled-goal", Some("rec-1".into()), SelectionMethod::Escalated, 2, 950, &usage);

        let traces = recorder.finish();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].id, trace_id);
        assert_eq!(traces[0].agent_runs[0].trace_id, trace_id);
        assert_eq!(traces[0].processing_window_type, WindowType::DailyWindow);
    }

    #[test]
    fn test_page_request_clamps() {
        let page = PageRequest::new(0, 10_000);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, PageRequest::MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_selection_method_parses_display_form() {
        for method in [
            SelectionMethod::Deterministic,
            SelectionMethod::PlaybookLookup,
            SelectionMethod::Escalated,
            SelectionMethod::Fallback,
        ] {
            assert_eq!(method.to_string().parse::<SelectionMethod>().unwrap(), method);
        }
    }
}
