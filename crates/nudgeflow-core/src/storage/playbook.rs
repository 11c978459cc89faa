//! Playbook persistence.
//!
//! The pipeline only reads through [`PlaybookReader`]; writes belong to the
//! feedback process that observes recommendation outcomes.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{fmt_ts, parse_ts, Store};
use crate::context::ContextKey;
use crate::error::Result;
use crate::playbook::{PlaybookEntry, PlaybookError, PlaybookReader};
use crate::recommendation::RecommendationType;

impl Store {
    /// Playbook rows for one context key. Rows naming an unknown intervention
    /// type are skipped.
    pub fn playbook_entries(&self, key: &ContextKey) -> Result<Vec<PlaybookEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT context_key, intervention_type, success_count, attempt_count, last_updated_at
                 FROM playbook_entries WHERE context_key = ?1
                 ORDER BY intervention_type",
            )?;
            let rows = stmt.query_map(params![key.to_storage_key()], |row| {
                let intervention: String = row.get(1)?;
                let updated: String = row.get(4)?;
                Ok((
                    intervention,
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    parse_ts(4, &updated)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (intervention, context_key, success_count, attempt_count, last_updated_at) = row?;
                match intervention.parse::<RecommendationType>() {
                    Ok(intervention_type) => entries.push(PlaybookEntry {
                        context_key,
                        intervention_type,
                        success_count,
                        attempt_count,
                        last_updated_at,
                    }),
                    Err(_) => tracing::debug!(%intervention, "skipping unknown playbook intervention"),
                }
            }
            Ok(entries)
        })
    }

    /// Record one observed outcome for an intervention in a context.
    pub fn record_playbook_outcome(
        &self,
        key: &ContextKey,
        intervention: RecommendationType,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO playbook_entries (context_key, intervention_type, success_count, attempt_count, last_updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(context_key, intervention_type) DO UPDATE SET
                     success_count = success_count + excluded.success_count,
                     attempt_count = attempt_count + 1,
                     last_updated_at = excluded.last_updated_at",
                params![key.to_storage_key(), intervention.as_str(), u32::from(success), fmt_ts(now)],
            )
        })?;
        Ok(())
    }

    /// Replace an entry wholesale (imports, seeding).
    pub fn upsert_playbook_entry(&self, entry: &PlaybookEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO playbook_entries
                    (context_key, intervention_type, success_count, attempt_count, last_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.context_key,
                    entry.intervention_type.as_str(),
                    entry.success_count,
                    entry.attempt_count,
                    fmt_ts(entry.last_updated_at),
                ],
            )
        })?;
        Ok(())
    }
}

impl PlaybookReader for Store {
    fn entries_for(&self, key: &ContextKey) -> Result<Vec<PlaybookEntry>, PlaybookError> {
        self.playbook_entries(key).map_err(|e| PlaybookError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CapacityBucket, DayTypeBucket, LevelBucket};

    fn key() -> ContextKey {
        ContextKey::new(LevelBucket::Low, CapacityBucket::Overloaded, DayTypeBucket::Weekend, LevelBucket::High)
    }

    #[test]
    fn test_record_outcome_upserts() {
        let store = Store::open_in_memory().unwrap();
        store.record_playbook_outcome(&key(), RecommendationType::RestBlock, true, Utc::now()).unwrap();
        store.record_playbook_outcome(&key(), RecommendationType::RestBlock, false, Utc::now()).unwrap();
        store.record_playbook_outcome(&key(), RecommendationType::RestBlock, true, Utc::now()).unwrap();

        let entries = store.entries_for(&key()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 3);
        assert_eq!(entries[0].success_count, 2);
        assert_eq!(entries[0].context_key, "low:overloaded:weekend:high");
    }

    #[test]
    fn test_unknown_intervention_rows_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO playbook_entries VALUES ('low:overloaded:weekend:high', 'meditate', 9, 10, ?1)",
                    params![fmt_ts(Utc::now())],
                )
            })
            .unwrap();
        store.record_playbook_outcome(&key(), RecommendationType::ReduceLoad, true, Utc::now()).unwrap();

        let entries = store.entries_for(&key()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].intervention_type, RecommendationType::ReduceLoad);
    }
}
