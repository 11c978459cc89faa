//! Database schema migrations for nudgeflow.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| row.get::<_, i32>(0))
        .unwrap_or_else(|e| {
            if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                tracing::warn!(error = %e, "failed to read schema_version");
            }
            0
        })
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: signals, recommendations, traces, agent runs, playbook.
///
/// The partial unique index on `recommendations` backs the dedup invariant:
/// at most one active row per `(user, context, target kind, target id)`.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS signals (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            source_event_type TEXT NOT NULL,
            priority          TEXT NOT NULL,
            window_type       TEXT NOT NULL,
            payload           TEXT NOT NULL DEFAULT 'null',
            occurred_at       TEXT NOT NULL,
            consumed_at       TEXT,
            consumed_by_run   TEXT
        );

        CREATE TABLE IF NOT EXISTS recommendations (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL,
            rec_type            TEXT NOT NULL,
            context             TEXT NOT NULL,
            status              TEXT NOT NULL,
            target_kind         TEXT NOT NULL,
            target_entity_id    TEXT,
            target_entity_title TEXT,
            action_kind         TEXT NOT NULL,
            action_payload      TEXT,
            action_summary      TEXT,
            title               TEXT NOT NULL,
            rationale           TEXT NOT NULL,
            score               REAL NOT NULL,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            accepted_at         TEXT,
            dismissed_at        TEXT,
            dismiss_reason      TEXT,
            snoozed_until       TEXT,
            executed_at         TEXT,
            executed_entity_id  TEXT
        );

        CREATE TABLE IF NOT EXISTS traces (
            id                     TEXT PRIMARY KEY,
            run_id                 TEXT NOT NULL,
            user_id                TEXT NOT NULL,
            rule_id                TEXT NOT NULL,
            recommendation_id      TEXT,
            context                TEXT NOT NULL,
            selection_method       TEXT NOT NULL,
            final_tier             INTEGER NOT NULL,
            processing_window_type TEXT NOT NULL,
            total_duration_ms      INTEGER NOT NULL,
            created_at             TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_run_stats (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            trace_id    TEXT NOT NULL REFERENCES traces(id),
            tokens      INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL,
            tier        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS playbook_entries (
            context_key       TEXT NOT NULL,
            intervention_type TEXT NOT NULL,
            success_count     INTEGER NOT NULL DEFAULT 0,
            attempt_count     INTEGER NOT NULL DEFAULT 0,
            last_updated_at   TEXT NOT NULL,
            PRIMARY KEY (context_key, intervention_type)
        );

        CREATE INDEX IF NOT EXISTS idx_signals_user_pending ON signals(user_id, consumed_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_recommendations_active_target
            ON recommendations(user_id, context, target_kind, COALESCE(target_entity_id, ''))
            WHERE status = 'active';
        CREATE INDEX IF NOT EXISTS idx_recommendations_user_status ON recommendations(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_agent_run_stats_trace ON agent_run_stats(trace_id);",
    )?;

    set_schema_version(&tx, 1)?;
    tx.commit()?;
    Ok(())
}

/// Migration v2: indexes for the administrative trace listing.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_traces_created_at ON traces(created_at);
         CREATE INDEX IF NOT EXISTS idx_traces_user_created ON traces(user_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_traces_run ON traces(run_id);",
    )?;

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_active_uniqueness_enforced_by_index() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO recommendations (id, user_id, rec_type, context, status, target_kind,
                target_entity_id, action_kind, title, rationale, score, created_at, updated_at)
             VALUES (?1, 'u1', 'reschedule_task', 'daily_plan', ?2, 'task', NULL, 'open_task_form',
                't', 'r', 0.5, '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')";

        conn.execute(insert, ["a", "active"]).unwrap();
        conn.execute(insert, ["b", "dismissed"]).unwrap();
        assert!(conn.execute(insert, ["c", "active"]).is_err());
    }
}
