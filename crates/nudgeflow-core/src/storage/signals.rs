//! Signal queue persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{fmt_ts, parse_col, parse_json, parse_opt_ts, parse_ts, Store};
use crate::error::{DatabaseError, Result};
use crate::signals::{SignalEntry, WindowType};

/// Unconsumed signals of one `(user, window)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWindow {
    pub user_id: String,
    pub window_type: WindowType,
    pub oldest_occurred_at: DateTime<Utc>,
    pub count: usize,
}

fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<SignalEntry> {
    let priority: String = row.get(3)?;
    let window_type: String = row.get(4)?;
    let payload: Option<String> = row.get(5)?;
    let occurred_at: String = row.get(6)?;

    Ok(SignalEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_event_type: row.get(2)?,
        priority: parse_col(3, &priority)?,
        window_type: parse_col(4, &window_type)?,
        payload: parse_json(5, payload)?.unwrap_or(serde_json::Value::Null),
        occurred_at: parse_ts(6, &occurred_at)?,
        consumed_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

/// Mark signals consumed by a run. Only rows still unconsumed are touched;
/// any shortfall means another run got there first and fails the caller's
/// transaction.
pub(crate) fn mark_signals_consumed(
    conn: &Connection,
    ids: &[String],
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE signals SET consumed_at = ?1, consumed_by_run = ?2
         WHERE id = ?3 AND consumed_at IS NULL",
    )?;
    let consumed_at = fmt_ts(now);
    let mut marked = 0;
    for id in ids {
        marked += stmt.execute(params![consumed_at, run_id, id])?;
    }
    if marked != ids.len() {
        return Err(DatabaseError::ConsumptionConflict {
            expected: ids.len(),
            marked,
        }
        .into());
    }
    Ok(())
}

impl Store {
    pub fn insert_signal(&self, entry: &SignalEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signals (id, user_id, source_event_type, priority, window_type, payload, occurred_at, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.user_id,
                    entry.source_event_type,
                    entry.priority.as_str(),
                    entry.window_type.as_str(),
                    payload,
                    fmt_ts(entry.occurred_at),
                    entry.consumed_at.map(fmt_ts),
                ],
            )
        })?;
        Ok(())
    }

    /// Unconsumed signals for `user_id` that occurred at or before `up_to`,
    /// oldest first.
    pub fn unconsumed_signals(&self, user_id: &str, up_to: DateTime<Utc>) -> Result<Vec<SignalEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, source_event_type, priority, window_type, payload, occurred_at, consumed_at
                 FROM signals
                 WHERE user_id = ?1 AND consumed_at IS NULL AND occurred_at <= ?2
                 ORDER BY occurred_at, id",
            )?;
            let rows = stmt.query_map(params![user_id, fmt_ts(up_to)], row_to_signal)?;
            rows.collect()
        })
    }

    pub fn get_signal(&self, id: &str) -> Result<Option<SignalEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, source_event_type, priority, window_type, payload, occurred_at, consumed_at
                 FROM signals WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], row_to_signal)?;
            rows.next().transpose()
        })
    }

    /// Pending signal counts grouped by `(user, window)`.
    pub fn pending_signal_windows(&self) -> Result<Vec<PendingWindow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, window_type, MIN(occurred_at), COUNT(*)
                 FROM signals
                 WHERE consumed_at IS NULL
                 GROUP BY user_id, window_type
                 ORDER BY user_id, window_type",
            )?;
            let rows = stmt.query_map([], |row| {
                let window_type: String = row.get(1)?;
                let oldest: String = row.get(2)?;
                Ok(PendingWindow {
                    user_id: row.get(0)?,
                    window_type: parse_col(1, &window_type)?,
                    oldest_occurred_at: parse_ts(2, &oldest)?,
                    count: row.get::<_, i64>(3)? as usize,
                })
            })?;
            rows.collect()
        })
    }

    /// Delete consumed signals whose consumption predates `older_than`.
    pub fn purge_consumed_signals(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM signals WHERE consumed_at IS NOT NULL AND consumed_at < ?1",
                params![fmt_ts(older_than)],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEvent;
    use crate::signals::SignalPriority;
    use chrono::Duration;

    fn signal(user: &str, at: DateTime<Utc>) -> SignalEntry {
        let event = DomainEvent::new(user, "task.completed", serde_json::json!({"task_id": "t1"})).at(at);
        SignalEntry::from_event(&event, SignalPriority::Medium, WindowType::DailyWindow)
    }

    #[test]
    fn test_signal_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let entry = signal("u1", Utc::now());
        store.insert_signal(&entry).unwrap();

        let loaded = store.get_signal(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.payload["task_id"], "t1");
        assert_eq!(loaded.window_type, WindowType::DailyWindow);
        assert!(loaded.consumed_at.is_none());
    }

    #[test]
    fn test_unconsumed_signals_excludes_later_arrivals() {
        let store = Store::open_in_memory().unwrap();
        let start = Utc::now();
        let before = signal("u1", start - Duration::minutes(5));
        let after = signal("u1", start + Duration::minutes(5));
        store.insert_signal(&before).unwrap();
        store.insert_signal(&after).unwrap();

        let pending = store.unconsumed_signals("u1", start).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, before.id);
    }

    #[test]
    fn test_double_consumption_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let entry = signal("u1", Utc::now());
        store.insert_signal(&entry).unwrap();
        let ids = vec![entry.id.clone()];

        store
            .transaction(|tx| mark_signals_consumed(tx, &ids, "run-1", Utc::now()))
            .unwrap();
        let second = store.transaction(|tx| mark_signals_consumed(tx, &ids, "run-2", Utc::now()));
        assert!(matches!(
            second,
            Err(crate::error::CoreError::Database(DatabaseError::ConsumptionConflict { expected: 1, marked: 0 }))
        ));
    }

    #[test]
    fn test_purge_only_removes_old_consumed() {
        let store = Store::open_in_memory().unwrap();
        let consumed = signal("u1", Utc::now() - Duration::days(40));
        let pending = signal("u1", Utc::now() - Duration::days(40));
        store.insert_signal(&consumed).unwrap();
        store.insert_signal(&pending).unwrap();
        store
            .transaction(|tx| {
                mark_signals_consumed(tx, &[consumed.id.clone()], "run-1", Utc::now() - Duration::days(31))
            })
            .unwrap();

        let purged = store.purge_consumed_signals(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_signal(&pending.id).unwrap().is_some());
    }
}
