//! Recommendation persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{fmt_ts, parse_col, parse_json, parse_opt_ts, parse_ts, Store};
use crate::error::Result;
use crate::recommendation::{
    Recommendation, RecommendationContext, RecommendationStatus, TargetKind,
};

const RECOMMENDATION_COLUMNS: &str = "id, user_id, rec_type, context, status, target_kind, target_entity_id,
    target_entity_title, action_kind, action_payload, action_summary, title, rationale, score,
    created_at, updated_at, accepted_at, dismissed_at, dismiss_reason, snoozed_until, executed_at,
    executed_entity_id";

fn row_to_recommendation(row: &rusqlite::Row) -> rusqlite::Result<Recommendation> {
    let rec_type: String = row.get(2)?;
    let context: String = row.get(3)?;
    let status: String = row.get(4)?;
    let target_kind: String = row.get(5)?;
    let action_kind: String = row.get(8)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    Ok(Recommendation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        rec_type: parse_col(2, &rec_type)?,
        context: parse_col(3, &context)?,
        status: parse_col(4, &status)?,
        target_kind: parse_col(5, &target_kind)?,
        target_entity_id: row.get(6)?,
        target_entity_title: row.get(7)?,
        action_kind: parse_col(8, &action_kind)?,
        action_payload: parse_json(9, row.get(9)?)?,
        action_summary: row.get(10)?,
        title: row.get(11)?,
        rationale: row.get(12)?,
        score: row.get(13)?,
        created_at: parse_ts(14, &created_at)?,
        updated_at: parse_ts(15, &updated_at)?,
        accepted_at: parse_opt_ts(16, row.get(16)?)?,
        dismissed_at: parse_opt_ts(17, row.get(17)?)?,
        dismiss_reason: row.get(18)?,
        snoozed_until: parse_opt_ts(19, row.get(19)?)?,
        executed_at: parse_opt_ts(20, row.get(20)?)?,
        executed_entity_id: row.get(21)?,
    })
}

fn json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

pub(crate) fn get_recommendation(conn: &Connection, id: &str) -> rusqlite::Result<Option<Recommendation>> {
    conn.query_row(
        &format!("SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = ?1"),
        params![id],
        row_to_recommendation,
    )
    .optional()
}

/// The Active recommendation occupying a dedup tuple, if any.
pub(crate) fn find_active_for_target(
    conn: &Connection,
    user_id: &str,
    context: RecommendationContext,
    target_kind: TargetKind,
    target_entity_id: Option<&str>,
) -> rusqlite::Result<Option<Recommendation>> {
    conn.query_row(
        &format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations
             WHERE user_id = ?1 AND context = ?2 AND target_kind = ?3
               AND COALESCE(target_entity_id, '') = COALESCE(?4, '')
               AND status = 'active'"
        ),
        params![user_id, context.as_str(), target_kind.as_str(), target_entity_id],
        row_to_recommendation,
    )
    .optional()
}

pub(crate) fn count_active(conn: &Connection, user_id: &str, context: RecommendationContext) -> rusqlite::Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM recommendations WHERE user_id = ?1 AND context = ?2 AND status = 'active'",
        params![user_id, context.as_str()],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
}

pub(crate) fn insert_recommendation(conn: &Connection, rec: &Recommendation) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO recommendations ({RECOMMENDATION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ),
        params![
            rec.id,
            rec.user_id,
            rec.rec_type.as_str(),
            rec.context.as_str(),
            rec.status.as_str(),
            rec.target_kind.as_str(),
            rec.target_entity_id,
            rec.target_entity_title,
            rec.action_kind.as_str(),
            json_text(&rec.action_payload),
            rec.action_summary,
            rec.title,
            rec.rationale,
            rec.score,
            fmt_ts(rec.created_at),
            fmt_ts(rec.updated_at),
            rec.accepted_at.map(fmt_ts),
            rec.dismissed_at.map(fmt_ts),
            rec.dismiss_reason,
            rec.snoozed_until.map(fmt_ts),
            rec.executed_at.map(fmt_ts),
            rec.executed_entity_id,
        ],
    )?;
    Ok(())
}

/// Refresh the candidate-derived fields of an existing Active row (dedup merge).
pub(crate) fn merge_candidate_fields(conn: &Connection, rec: &Recommendation) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE recommendations
         SET rec_type = ?2, action_kind = ?3, action_payload = ?4, action_summary = ?5, title = ?6,
             rationale = ?7, score = ?8, target_entity_title = ?9, updated_at = ?10
         WHERE id = ?1 AND status = 'active'",
        params![
            rec.id,
            rec.rec_type.as_str(),
            rec.action_kind.as_str(),
            json_text(&rec.action_payload),
            rec.action_summary,
            rec.title,
            rec.rationale,
            rec.score,
            rec.target_entity_title,
            fmt_ts(rec.updated_at),
        ],
    )?;
    Ok(())
}

/// Compare-and-set the lifecycle columns. Returns false when the row was no
/// longer in `expected` status.
pub(crate) fn write_transition(
    conn: &Connection,
    rec: &Recommendation,
    expected: RecommendationStatus,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE recommendations
         SET status = ?2, accepted_at = ?3, dismissed_at = ?4, dismiss_reason = ?5, snoozed_until = ?6,
             executed_at = ?7, executed_entity_id = ?8, updated_at = ?9
         WHERE id = ?1 AND status = ?10",
        params![
            rec.id,
            rec.status.as_str(),
            rec.accepted_at.map(fmt_ts),
            rec.dismissed_at.map(fmt_ts),
            rec.dismiss_reason,
            rec.snoozed_until.map(fmt_ts),
            rec.executed_at.map(fmt_ts),
            rec.executed_entity_id,
            fmt_ts(rec.updated_at),
            expected.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

impl Store {
    pub fn get_recommendation(&self, id: &str) -> Result<Option<Recommendation>> {
        self.with_conn(|conn| get_recommendation(conn, id))
    }

    /// Recommendations for a user, highest score first, optionally filtered.
    pub fn list_recommendations(
        &self,
        user_id: &str,
        status: Option<RecommendationStatus>,
        context: Option<RecommendationContext>,
    ) -> Result<Vec<Recommendation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR context = ?3)
                 ORDER BY score DESC, created_at, id"
            ))?;
            let rows = stmt.query_map(
                params![user_id, status.map(|s| s.as_str()), context.map(|c| c.as_str())],
                row_to_recommendation,
            )?;
            rows.collect()
        })
    }

    /// Snoozed recommendations whose snooze ended at or before `now`.
    pub fn snoozed_until_before(&self, now: DateTime<Utc>) -> Result<Vec<Recommendation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations
                 WHERE status = 'snoozed' AND snoozed_until <= ?1
                 ORDER BY snoozed_until, id"
            ))?;
            let rows = stmt.query_map(params![fmt_ts(now)], row_to_recommendation)?;
            rows.collect()
        })
    }

    /// Active recommendations last refreshed before `cutoff`.
    pub fn active_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Recommendation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations
                 WHERE status = 'active' AND updated_at < ?1
                 ORDER BY updated_at, id"
            ))?;
            let rows = stmt.query_map(params![fmt_ts(cutoff)], row_to_recommendation)?;
            rows.collect()
        })
    }
}
