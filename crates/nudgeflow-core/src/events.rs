use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A domain event published by the surrounding services (task, habit, goal,
/// check-in...). The event type is a dotted string such as `task.completed`;
/// whether it becomes a signal is decided by the classification table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub user_id: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(user_id: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            user_id: user_id.into(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}
