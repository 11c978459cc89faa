//! Trace persistence and the administrative listing query.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use super::{fmt_ts, parse_col, parse_ts, Store};
use crate::error::Result;
use crate::trace::{AgentRunStat, PageRequest, RecommendationTrace, TraceFilter, TracePage, TraceRow};

const TRACE_COLUMNS: &str = "t.id, t.run_id, t.user_id, t.rule_id, t.recommendation_id, t.context,
    t.selection_method, t.final_tier, t.processing_window_type, t.total_duration_ms, t.created_at";

fn row_to_trace(row: &rusqlite::Row) -> rusqlite::Result<RecommendationTrace> {
    let context: String = row.get(5)?;
    let method: String = row.get(6)?;
    let window: String = row.get(8)?;
    let created_at: String = row.get(10)?;

    Ok(RecommendationTrace {
        id: row.get(0)?,
        run_id: row.get(1)?,
        user_id: row.get(2)?,
        rule_id: row.get(3)?,
        recommendation_id: row.get(4)?,
        context: parse_col(5, &context)?,
        selection_method: parse_col(6, &method)?,
        final_tier: row.get(7)?,
        processing_window_type: parse_col(8, &window)?,
        total_duration_ms: row.get::<_, i64>(9)? as u64,
        created_at: parse_ts(10, &created_at)?,
        agent_runs: Vec::new(),
    })
}

pub(crate) fn insert_trace(conn: &Connection, trace: &RecommendationTrace) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO traces (id, run_id, user_id, rule_id, recommendation_id, context, selection_method,
                             final_tier, processing_window_type, total_duration_ms, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            trace.id,
            trace.run_id,
            trace.user_id,
            trace.rule_id,
            trace.recommendation_id,
            trace.context.as_str(),
            trace.selection_method.as_str(),
            trace.final_tier,
            trace.processing_window_type.as_str(),
            trace.total_duration_ms as i64,
            fmt_ts(trace.created_at),
        ],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO agent_run_stats (trace_id, tokens, duration_ms, tier) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for run in &trace.agent_runs {
        stmt.execute(params![run.trace_id, run.tokens as i64, run.duration_ms as i64, run.tier])?;
    }
    Ok(())
}

fn agent_runs_for(conn: &Connection, trace_id: &str) -> rusqlite::Result<Vec<AgentRunStat>> {
    let mut stmt = conn.prepare_cached(
        "SELECT trace_id, tokens, duration_ms, tier FROM agent_run_stats WHERE trace_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![trace_id], |row| {
        Ok(AgentRunStat {
            trace_id: row.get(0)?,
            tokens: row.get::<_, i64>(1)? as u64,
            duration_ms: row.get::<_, i64>(2)? as u64,
            tier: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// WHERE clause and bound values for a listing filter.
fn filter_clause(filter: &TraceFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(from) = filter.from {
        clauses.push("t.created_at >= ?");
        values.push(Value::Text(fmt_ts(from)));
    }
    if let Some(to) = filter.to {
        clauses.push("t.created_at < ?");
        values.push(Value::Text(fmt_ts(to)));
    }
    if let Some(context) = filter.context {
        clauses.push("t.context = ?");
        values.push(Value::Text(context.as_str().to_string()));
    }
    if let Some(status) = filter.status {
        clauses.push("r.status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(user_id) = &filter.user_id {
        clauses.push("t.user_id = ?");
        values.push(Value::Text(user_id.clone()));
    }
    if let Some(method) = filter.selection_method {
        clauses.push("t.selection_method = ?");
        values.push(Value::Text(method.as_str().to_string()));
    }
    if let Some(tier) = filter.final_tier {
        clauses.push("t.final_tier = ?");
        values.push(Value::Integer(i64::from(tier)));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

impl Store {
    /// Filtered, paginated trace listing, newest first.
    pub fn list_traces(&self, filter: &TraceFilter, page: PageRequest) -> Result<TracePage> {
        let (where_clause, values) = filter_clause(filter);

        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM traces t
                     LEFT JOIN recommendations r ON r.id = t.recommendation_id
                     {where_clause}"
                ),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let mut page_values = values.clone();
            page_values.push(Value::Integer(i64::from(page.page_size)));
            page_values.push(Value::Integer(page.offset() as i64));

            let mut stmt = conn.prepare(&format!(
                "SELECT {TRACE_COLUMNS}, r.status,
                        COALESCE(a.run_count, 0), COALESCE(a.total_tokens, 0)
                 FROM traces t
                 LEFT JOIN recommendations r ON r.id = t.recommendation_id
                 LEFT JOIN (
                     SELECT trace_id, COUNT(*) AS run_count, SUM(tokens) AS total_tokens
                     FROM agent_run_stats GROUP BY trace_id
                 ) a ON a.trace_id = t.id
                 {where_clause}
                 ORDER BY t.created_at DESC, t.id DESC
                 LIMIT ? OFFSET ?"
            ))?;
            let rows = stmt.query_map(params_from_iter(page_values.iter()), |row| {
                let status: Option<String> = row.get(11)?;
                Ok(TraceRow {
                    trace: row_to_trace(row)?,
                    recommendation_status: status.map(|s| parse_col(11, &s)).transpose()?,
                    agent_run_count: row.get::<_, i64>(12)? as u64,
                    total_tokens: row.get::<_, i64>(13)? as u64,
                })
            })?;
            let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(TracePage {
                rows,
                total: total as u64,
                page: page.page,
                page_size: page.page_size,
            })
        })
    }

    /// All traces of one run with their agent-run stats, oldest first.
    pub fn traces_for_run(&self, run_id: &str) -> Result<Vec<RecommendationTrace>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRACE_COLUMNS} FROM traces t WHERE t.run_id = ?1 ORDER BY t.created_at, t.id"
            ))?;
            let mut traces = stmt
                .query_map(params![run_id], row_to_trace)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for trace in &mut traces {
                trace.agent_runs = agent_runs_for(conn, &trace.id)?;
            }
            Ok(traces)
        })
    }
}
