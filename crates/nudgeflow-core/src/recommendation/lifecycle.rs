//! Recommendation state machine.
//!
//! ```text
//! Active ──accept──▶ Accepted ──execute──▶ Executed
//!   │ ▲
//!   │ └──wake── Snoozed ◀──snooze── Active
//!   ├──dismiss──▶ Dismissed
//!   └──expire───▶ Expired
//! ```
//!
//! At most one Active recommendation exists per `(user, context, target kind,
//! target id)`. Materializing a candidate for an occupied tuple refreshes the
//! existing record instead of inserting a second one.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{DirectRecommendationCandidate, Recommendation, RecommendationContext, RecommendationStatus};
use crate::error::{CoreError, LifecycleError, Result, ValidationError};
use crate::storage::recommendations::{
    count_active, find_active_for_target, get_recommendation, insert_recommendation, merge_candidate_fields,
    write_transition,
};
use crate::storage::Store;

/// Lifecycle limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// New inserts beyond this many Active records per `(user, context)` are skipped.
    #[serde(default = "default_max_active")]
    pub max_active_per_context: usize,
    #[serde(default = "default_snooze_hours")]
    pub default_snooze_hours: u32,
    /// Active records not refreshed for this long expire.
    #[serde(default = "default_expire_after_hours")]
    pub expire_after_hours: u32,
}

fn default_max_active() -> usize {
    5
}
fn default_snooze_hours() -> u32 {
    24
}
fn default_expire_after_hours() -> u32 {
    72
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_active_per_context: default_max_active(),
            default_snooze_hours: default_snooze_hours(),
            expire_after_hours: default_expire_after_hours(),
        }
    }
}

/// What materializing one candidate did.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterializeOutcome {
    Created(Recommendation),
    /// An Active record for the same target was refreshed in place.
    Merged(Recommendation),
    /// The context already holds the maximum number of Active records.
    SkippedAtCapacity,
}

impl MaterializeOutcome {
    pub fn recommendation(&self) -> Option<&Recommendation> {
        match self {
            MaterializeOutcome::Created(rec) | MaterializeOutcome::Merged(rec) => Some(rec),
            MaterializeOutcome::SkippedAtCapacity => None,
        }
    }
}

/// Counts from a snooze wake-up pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WakeReport {
    pub woken: usize,
    /// Snoozed records whose target gained another Active record meanwhile.
    pub expired: usize,
}

/// Owns every recommendation status change.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Arc<Store>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(store: Arc<Store>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Materialize a candidate on a connection the caller controls, usually
    /// the pipeline run's write transaction.
    pub(crate) fn materialize_in(
        &self,
        conn: &Connection,
        user_id: &str,
        candidate: &DirectRecommendationCandidate,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome> {
        let (context, target_kind, target_id) = candidate.target_key();
        if let Some(existing) = find_active_for_target(conn, user_id, context, target_kind, target_id)? {
            let merged = Recommendation {
                rec_type: candidate.rec_type,
                action_kind: candidate.action_kind,
                action_payload: candidate.action_payload.clone(),
                action_summary: candidate.action_summary.clone(),
                title: candidate.title.clone(),
                rationale: candidate.rationale.clone(),
                score: candidate.score,
                target_entity_title: candidate
                    .target_entity_title
                    .clone()
                    .or(existing.target_entity_title.clone()),
                updated_at: now,
                ..existing
            };
            merge_candidate_fields(conn, &merged)?;
            return Ok(MaterializeOutcome::Merged(merged));
        }

        if count_active(conn, user_id, context)? >= self.config.max_active_per_context {
            tracing::debug!(user_id, context = %context, "active cap reached, skipping candidate");
            return Ok(MaterializeOutcome::SkippedAtCapacity);
        }

        let rec = Recommendation::from_candidate(Uuid::new_v4().to_string(), user_id, candidate, now);
        insert_recommendation(conn, &rec)?;
        Ok(MaterializeOutcome::Created(rec))
    }

    /// Materialize a single candidate in its own transaction.
    pub fn materialize(
        &self,
        user_id: &str,
        candidate: &DirectRecommendationCandidate,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome> {
        self.store.transaction(|tx| self.materialize_in(tx, user_id, candidate, now))
    }

    /// Fetch a recommendation or fail with `NotFound`.
    pub fn get(&self, id: &str) -> Result<Recommendation> {
        self.store
            .get_recommendation(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()).into())
    }

    pub fn list_active(&self, user_id: &str, context: Option<RecommendationContext>) -> Result<Vec<Recommendation>> {
        self.store
            .list_recommendations(user_id, Some(RecommendationStatus::Active), context)
    }

    /// Load, check, update and write one record atomically.
    fn transition(
        &self,
        id: &str,
        action: &'static str,
        from: RecommendationStatus,
        apply: impl FnOnce(&mut Recommendation),
    ) -> Result<Recommendation> {
        self.store.transaction(|tx| {
            let mut rec = get_recommendation(tx, id)?.ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
            if rec.status != from {
                if rec.status == RecommendationStatus::Executed && action == "execute" {
                    return Err(LifecycleError::AlreadyExecuted(id.to_string()).into());
                }
                return Err(LifecycleError::InvalidTransition {
                    id: id.to_string(),
                    from: rec.status,
                    action,
                }
                .into());
            }
            apply(&mut rec);
            if !write_transition(tx, &rec, from)? {
                return Err(LifecycleError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    action,
                }
                .into());
            }
            tracing::info!(recommendation_id = id, action, status = %rec.status, "recommendation transitioned");
            Ok(rec)
        })
    }

    pub fn accept(&self, id: &str, now: DateTime<Utc>) -> Result<Recommendation> {
        self.transition(id, "accept", RecommendationStatus::Active, |rec| {
            rec.status = RecommendationStatus::Accepted;
            rec.accepted_at = Some(now);
            rec.updated_at = now;
        })
    }

    pub fn dismiss(&self, id: &str, reason: Option<String>, now: DateTime<Utc>) -> Result<Recommendation> {
        self.transition(id, "dismiss", RecommendationStatus::Active, |rec| {
            rec.status = RecommendationStatus::Dismissed;
            rec.dismissed_at = Some(now);
            rec.dismiss_reason = reason;
            rec.updated_at = now;
        })
    }

    /// Snooze until `until`, or for the configured default when None.
    pub fn snooze(&self, id: &str, until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Recommendation> {
        let until = until.unwrap_or_else(|| now + Duration::hours(i64::from(self.config.default_snooze_hours)));
        if until <= now {
            return Err(CoreError::Validation(ValidationError::InvalidValue {
                field: "snoozed_until".to_string(),
                message: "must be in the future".to_string(),
            }));
        }
        self.transition(id, "snooze", RecommendationStatus::Active, |rec| {
            rec.status = RecommendationStatus::Snoozed;
            rec.snoozed_until = Some(until);
            rec.updated_at = now;
        })
    }

    /// Accepted → Executed after the collaborator command succeeded.
    pub(crate) fn mark_executed(&self, id: &str, entity_id: Option<String>, now: DateTime<Utc>) -> Result<Recommendation> {
        self.transition(id, "execute", RecommendationStatus::Accepted, |rec| {
            rec.status = RecommendationStatus::Executed;
            rec.executed_at = Some(now);
            rec.executed_entity_id = entity_id;
            rec.updated_at = now;
        })
    }

    /// Reactivate snoozed records whose snooze ended. A record whose target
    /// gained a new Active record meanwhile expires instead.
    pub fn wake_snoozed(&self, now: DateTime<Utc>) -> Result<WakeReport> {
        let due = self.store.snoozed_until_before(now)?;
        let mut report = WakeReport::default();

        self.store.transaction(|tx| {
            for rec in due {
                let (context, kind, target) = (rec.context, rec.target_kind, rec.target_entity_id.clone());
                let occupied = find_active_for_target(tx, &rec.user_id, context, kind, target.as_deref())?.is_some();
                let mut next = rec;
                next.snoozed_until = None;
                next.updated_at = now;
                next.status = if occupied {
                    RecommendationStatus::Expired
                } else {
                    RecommendationStatus::Active
                };
                if write_transition(tx, &next, RecommendationStatus::Snoozed)? {
                    if occupied {
                        report.expired += 1;
                    } else {
                        report.woken += 1;
                    }
                }
            }
            Ok(())
        })?;

        if report.woken + report.expired > 0 {
            tracing::info!(woken = report.woken, expired = report.expired, "processed ended snoozes");
        }
        Ok(report)
    }

    /// Expire Active records not refreshed within `expire_after_hours`.
    ///
    /// Snoozed records are not aged here. They can still end up Expired:
    /// [`wake_snoozed`](Self::wake_snoozed) expires one whose target gained
    /// another Active record while it slept.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::hours(i64::from(self.config.expire_after_hours));
        let stale = self.store.active_updated_before(cutoff)?;

        let expired = self.store.transaction(|tx| {
            let mut expired = 0;
            for mut rec in stale {
                rec.status = RecommendationStatus::Expired;
                rec.updated_at = now;
                if write_transition(tx, &rec, RecommendationStatus::Active)? {
                    expired += 1;
                }
            }
            Ok(expired)
        })?;

        if expired > 0 {
            tracing::info!(expired, "expired stale recommendations");
        }
        Ok(expired)
    }
}
