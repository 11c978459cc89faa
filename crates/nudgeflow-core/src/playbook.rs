//! Context-bucketed effectiveness lookup.
//!
//! The playbook maps a [`ContextKey`] to intervention types together with how
//! often they were tried and how often they worked. A separate feedback
//! process writes outcomes; the pipeline only reads, and any read failure or
//! missing entry counts as "no lookup hit".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::ContextKey;
use crate::recommendation::RecommendationType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookEntry {
    /// Storage form of the context key.
    pub context_key: String,
    pub intervention_type: RecommendationType,
    pub success_count: u32,
    pub attempt_count: u32,
    pub last_updated_at: DateTime<Utc>,
}

impl PlaybookEntry {
    pub fn success_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            0.0
        } else {
            f64::from(self.success_count.min(self.attempt_count)) / f64::from(self.attempt_count)
        }
    }

    /// Higher success rate first, more attempts breaking ties.
    fn outranks(&self, other: &PlaybookEntry) -> bool {
        match self.success_rate().partial_cmp(&other.success_rate()) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Equal) => self.attempt_count > other.attempt_count,
            _ => false,
        }
    }
}

/// Attestation thresholds for a playbook hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookPolicy {
    #[serde(default = "default_min_attempts")]
    pub min_attempts: u32,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

fn default_min_attempts() -> u32 {
    5
}
fn default_min_success_rate() -> f64 {
    0.6
}

impl Default for PlaybookPolicy {
    fn default() -> Self {
        Self {
            min_attempts: default_min_attempts(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

impl PlaybookPolicy {
    pub fn is_attested(&self, entry: &PlaybookEntry) -> bool {
        entry.attempt_count >= self.min_attempts && entry.success_rate() >= self.min_success_rate
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("playbook read failed: {0}")]
pub struct PlaybookError(pub String);

/// Read access to playbook entries.
pub trait PlaybookReader: Send + Sync {
    fn entries_for(&self, key: &ContextKey) -> Result<Vec<PlaybookEntry>, PlaybookError>;
}

/// Playbook lookups with an attestation policy.
#[derive(Clone)]
pub struct Playbook {
    reader: Arc<dyn PlaybookReader>,
    policy: PlaybookPolicy,
}

impl Playbook {
    pub fn new(reader: Arc<dyn PlaybookReader>, policy: PlaybookPolicy) -> Self {
        Self { reader, policy }
    }

    pub fn policy(&self) -> &PlaybookPolicy {
        &self.policy
    }

    fn entries(&self, key: &ContextKey) -> Vec<PlaybookEntry> {
        match self.reader.entries_for(key) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(context_key = %key, error = %e, "playbook read failed, treating as miss");
                Vec::new()
            }
        }
    }

    fn best<'a>(entries: impl Iterator<Item = &'a PlaybookEntry>) -> Option<&'a PlaybookEntry> {
        entries.fold(None, |best, entry| match best {
            Some(current) if !entry.outranks(current) => Some(current),
            _ => Some(entry),
        })
    }

    /// Best sufficiently-attested intervention for `key`.
    pub fn lookup(&self, key: &ContextKey) -> Option<PlaybookEntry> {
        let entries = self.entries(key);
        Self::best(entries.iter().filter(|e| self.policy.is_attested(e))).cloned()
    }

    /// Best intervention with any history for `key`, ignoring the policy.
    /// Used as a fallback when higher tiers fail.
    pub fn best_effort(&self, key: &ContextKey) -> Option<PlaybookEntry> {
        let entries = self.entries(key);
        Self::best(entries.iter().filter(|e| e.attempt_count > 0)).cloned()
    }
}

/// Playbook kept in memory, for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryPlaybook {
    entries: RwLock<HashMap<(String, RecommendationType), PlaybookEntry>>,
}

impl InMemoryPlaybook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: PlaybookEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert((entry.context_key.clone(), entry.intervention_type), entry);
    }

    /// Feedback-loop write: one more attempt, optionally successful.
    pub fn record_outcome(&self, key: &ContextKey, intervention: RecommendationType, success: bool) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry((key.to_storage_key(), intervention))
            .or_insert_with(|| PlaybookEntry {
                context_key: key.to_storage_key(),
                intervention_type: intervention,
                success_count: 0,
                attempt_count: 0,
                last_updated_at: Utc::now(),
            });
        entry.attempt_count += 1;
        if success {
            entry.success_count += 1;
        }
        entry.last_updated_at = Utc::now();
    }
}

impl PlaybookReader for InMemoryPlaybook {
    fn entries_for(&self, key: &ContextKey) -> Result<Vec<PlaybookEntry>, PlaybookError> {
        let storage_key = key.to_storage_key();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<PlaybookEntry> = entries
            .values()
            .filter(|e| e.context_key == storage_key)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.intervention_type.as_str().cmp(b.intervention_type.as_str()));
        Ok(found)
    }
}
