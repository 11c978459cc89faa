//! Per-user signal buffering by processing window.
//!
//! Signals are persisted as soon as they are classified and stay unconsumed
//! until a pipeline run materializes its results. Consumption happens inside
//! the run's write transaction, so a run that fails or is cancelled leaves its
//! signals in the queue for the next attempt.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::classifier::{Classification, SignalClassifier, SignalPriority, WindowType};
use crate::error::Result;
use crate::events::DomainEvent;
use crate::storage::Store;

/// A classified, queued domain event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEntry {
    pub id: String,
    pub user_id: String,
    pub source_event_type: String,
    pub priority: SignalPriority,
    pub window_type: WindowType,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl SignalEntry {
    pub fn from_event(event: &DomainEvent, priority: SignalPriority, window_type: WindowType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: event.user_id.clone(),
            source_event_type: event.event_type.clone(),
            priority,
            window_type,
            payload: event.payload.clone(),
            occurred_at: event.occurred_at,
            consumed_at: None,
        }
    }

    /// Instant at which this signal's window closes.
    pub fn window_closes_at(&self) -> DateTime<Utc> {
        self.window_type.closes_at(self.occurred_at)
    }
}

fn midnight(date: NaiveDate, fallback: DateTime<Utc>) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(fallback)
}

impl WindowType {
    /// Wall-clock close of the window a signal observed at `occurred_at` belongs to.
    ///
    /// Daily windows close at the next UTC midnight, weekly windows at the next
    /// Monday 00:00 UTC.
    pub fn closes_at(&self, occurred_at: DateTime<Utc>) -> DateTime<Utc> {
        let date = occurred_at.date_naive();
        match self {
            WindowType::Immediate => occurred_at,
            WindowType::DailyWindow => midnight(date + Duration::days(1), occurred_at),
            WindowType::WeeklyWindow => {
                let days_until_monday = 7 - i64::from(date.weekday().num_days_from_monday());
                midnight(date + Duration::days(days_until_monday), occurred_at)
            }
        }
    }
}

/// Result of ingesting one domain event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Queued(SignalEntry),
    NoSignal,
    Unmapped,
}

/// A user whose buffered signals are ready for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueUser {
    pub user_id: String,
    /// Most urgent closed window among the user's pending signals.
    pub window: WindowType,
    pub pending: usize,
}

/// Buffers classified signals per `(user, window)` until the window closes.
pub struct WindowAggregator {
    store: Arc<Store>,
    classifier: SignalClassifier,
}

impl WindowAggregator {
    pub fn new(store: Arc<Store>, classifier: SignalClassifier) -> Self {
        Self { store, classifier }
    }

    pub fn classifier(&self) -> &SignalClassifier {
        &self.classifier
    }

    /// Classify an event and queue it if it maps to a signal.
    pub fn ingest(&self, event: &DomainEvent) -> Result<IngestOutcome> {
        match self.classifier.classify(&event.event_type) {
            Classification::Signal { priority, window } => {
                let entry = SignalEntry::from_event(event, priority, window);
                self.store.insert_signal(&entry)?;
                tracing::debug!(
                    user_id = %entry.user_id,
                    event_type = %entry.source_event_type,
                    window = %window,
                    "queued signal"
                );
                Ok(IngestOutcome::Queued(entry))
            }
            Classification::NoSignal => Ok(IngestOutcome::NoSignal),
            Classification::Unmapped => Ok(IngestOutcome::Unmapped),
        }
    }

    /// Users with at least one unconsumed signal whose window closed by `now`.
    pub fn due_users(&self, now: DateTime<Utc>) -> Result<Vec<DueUser>> {
        let pending = self.store.pending_signal_windows()?;

        let mut due: HashMap<String, DueUser> = HashMap::new();
        for window in pending {
            if window.window_type.closes_at(window.oldest_occurred_at) > now {
                continue;
            }
            let entry = due.entry(window.user_id.clone()).or_insert_with(|| DueUser {
                user_id: window.user_id.clone(),
                window: window.window_type,
                pending: 0,
            });
            entry.pending += window.count;
            if window.window_type.urgency() < entry.window.urgency() {
                entry.window = window.window_type;
            }
        }

        let mut due: Vec<DueUser> = due.into_values().collect();
        due.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(due)
    }

    /// Unconsumed signals for a user that occurred no later than `up_to`.
    pub fn pending_for(&self, user_id: &str, up_to: DateTime<Utc>) -> Result<Vec<SignalEntry>> {
        self.store.unconsumed_signals(user_id, up_to)
    }

    /// Delete consumed signals whose consumption predates `older_than`.
    pub fn purge_consumed(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_consumed_signals(older_than)?;
        if purged > 0 {
            tracing::info!(purged, "purged consumed signals past retention");
        }
        Ok(purged)
    }
}
