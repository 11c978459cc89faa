//! Signal classification.
//!
//! Maps domain event types to a priority and a processing window. The mapping
//! is a table of plain data: the default entries live in
//! [`DEFAULT_CLASSIFICATIONS`] and configuration may override single entries.
//! Event types missing from the table fail closed and are dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Signal priority, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl SignalPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalPriority::Low => "low",
            SignalPriority::Medium => "medium",
            SignalPriority::High => "high",
            SignalPriority::Critical => "critical",
        }
    }
}

impl FromStr for SignalPriority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(SignalPriority::Low),
            "medium" => Ok(SignalPriority::Medium),
            "high" => Ok(SignalPriority::High),
            "critical" => Ok(SignalPriority::Critical),
            other => Err(ValidationError::invalid("priority", other)),
        }
    }
}

/// Batching interval after which buffered signals trigger a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Immediate,
    DailyWindow,
    WeeklyWindow,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Immediate => "immediate",
            WindowType::DailyWindow => "daily_window",
            WindowType::WeeklyWindow => "weekly_window",
        }
    }

    /// Urgency rank used to pick the dominant window of a batch (lower is more urgent).
    pub fn urgency(&self) -> u8 {
        match self {
            WindowType::Immediate => 0,
            WindowType::DailyWindow => 1,
            WindowType::WeeklyWindow => 2,
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(WindowType::Immediate),
            "daily_window" => Ok(WindowType::DailyWindow),
            "weekly_window" => Ok(WindowType::WeeklyWindow),
            other => Err(ValidationError::invalid("window_type", other)),
        }
    }
}

/// Classification record for one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalClass {
    /// The event enters the signal queue.
    Signal {
        priority: SignalPriority,
        window: WindowType,
    },
    /// The event is excluded entirely (corrections, internal bookkeeping).
    NoSignal,
}

/// Outcome of classifying one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Signal {
        priority: SignalPriority,
        window: WindowType,
    },
    NoSignal,
    /// The event type is not in the table and is dropped.
    Unmapped,
}

const fn signal(priority: SignalPriority, window: WindowType) -> SignalClass {
    SignalClass::Signal { priority, window }
}

/// Default event type mapping.
pub const DEFAULT_CLASSIFICATIONS: &[(&str, SignalClass)] = &[
    // tasks
    ("task.created", signal(SignalPriority::Low, WindowType::DailyWindow)),
    ("task.completed", signal(SignalPriority::Medium, WindowType::DailyWindow)),
    ("task.overdue", signal(SignalPriority::High, WindowType::Immediate)),
    ("task.rescheduled", signal(SignalPriority::Low, WindowType::DailyWindow)),
    ("task.deleted", signal(SignalPriority::Low, WindowType::WeeklyWindow)),
    // habits
    ("habit.created", signal(SignalPriority::Low, WindowType::DailyWindow)),
    ("habit.checked_in", signal(SignalPriority::Low, WindowType::DailyWindow)),
    ("habit.missed", signal(SignalPriority::Medium, WindowType::DailyWindow)),
    ("habit.streak_broken", signal(SignalPriority::High, WindowType::Immediate)),
    ("habit.paused", signal(SignalPriority::Low, WindowType::WeeklyWindow)),
    // goals
    ("goal.created", signal(SignalPriority::Medium, WindowType::DailyWindow)),
    ("goal.progress_updated", signal(SignalPriority::Low, WindowType::WeeklyWindow)),
    ("goal.deadline_approaching", signal(SignalPriority::High, WindowType::DailyWindow)),
    ("goal.completed", signal(SignalPriority::Medium, WindowType::WeeklyWindow)),
    ("goal.abandoned", signal(SignalPriority::Medium, WindowType::WeeklyWindow)),
    // check-ins and capacity
    ("checkin.submitted", signal(SignalPriority::Medium, WindowType::DailyWindow)),
    ("energy.logged", signal(SignalPriority::Medium, WindowType::DailyWindow)),
    ("energy.crashed", signal(SignalPriority::Critical, WindowType::Immediate)),
    ("capacity.exceeded", signal(SignalPriority::Critical, WindowType::Immediate)),
    ("season.changed", signal(SignalPriority::Medium, WindowType::WeeklyWindow)),
    // experiments
    ("experiment.completed", signal(SignalPriority::Medium, WindowType::WeeklyWindow)),
    ("experiment.abandoned", signal(SignalPriority::Low, WindowType::WeeklyWindow)),
    // corrections and bookkeeping
    ("checkin.corrected", SignalClass::NoSignal),
    ("task.updated", SignalClass::NoSignal),
    ("profile.updated", SignalClass::NoSignal),
    ("recommendation.accepted", SignalClass::NoSignal),
    ("recommendation.dismissed", SignalClass::NoSignal),
    ("recommendation.snoozed", SignalClass::NoSignal),
    ("recommendation.executed", SignalClass::NoSignal),
    ("sync.completed", SignalClass::NoSignal),
];

/// Classification table, constructed once and passed to the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationTable {
    entries: BTreeMap<String, SignalClass>,
}

impl ClassificationTable {
    /// Build a table from explicit entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, SignalClass)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Default table with optional per-entry overrides applied on top.
    pub fn with_overrides(overrides: &BTreeMap<String, SignalClass>) -> Self {
        let mut table = Self::default();
        for (event_type, class) in overrides {
            table.entries.insert(event_type.clone(), *class);
        }
        table
    }

    pub fn get(&self, event_type: &str) -> Option<&SignalClass> {
        self.entries.get(event_type)
    }

    /// All entries in event-type order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &SignalClass)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self::from_entries(DEFAULT_CLASSIFICATIONS.iter().map(|(k, v)| (*k, *v)))
    }
}

/// Tags incoming domain events with a priority and window type.
#[derive(Debug, Clone, Default)]
pub struct SignalClassifier {
    table: ClassificationTable,
}

impl SignalClassifier {
    pub fn new(table: ClassificationTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ClassificationTable {
        &self.table
    }

    pub fn classify(&self, event_type: &str) -> Classification {
        match self.table.get(event_type) {
            Some(SignalClass::Signal { priority, window }) => Classification::Signal {
                priority: *priority,
                window: *window,
            },
            Some(SignalClass::NoSignal) => Classification::NoSignal,
            None => {
                tracing::warn!(event_type, "dropping event with no classification entry");
                Classification::Unmapped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_stable_for_whole_table() {
        let classifier = SignalClassifier::default();
        for (event_type, class) in classifier.table().entries() {
            let first = classifier.classify(event_type);
            let second = classifier.classify(event_type);
            assert_eq!(first, second, "{event_type} classified differently on rerun");
            match class {
                SignalClass::Signal { .. } => assert!(matches!(first, Classification::Signal { .. })),
                SignalClass::NoSignal => assert_eq!(first, Classification::NoSignal),
            }
        }
    }

    #[test]
    fn test_unmapped_event_fails_closed() {
        let classifier = SignalClassifier::default();
        assert_eq!(classifier.classify("calendar.imported"), Classification::Unmapped);
        assert_eq!(classifier.classify(""), Classification::Unmapped);
    }

    #[test]
    fn test_corrections_are_no_signal() {
        let classifier = SignalClassifier::default();
        assert_eq!(classifier.classify("checkin.corrected"), Classification::NoSignal);
        assert_eq!(classifier.classify("recommendation.accepted"), Classification::NoSignal);
    }

    #[test]
    fn test_default_table_has_no_duplicate_keys() {
        let table = ClassificationTable::default();
        assert_eq!(table.len(), DEFAULT_CLASSIFICATIONS.len());
    }

    #[test]
    fn test_overrides_replace_single_entries() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "task.created".to_string(),
            SignalClass::Signal {
                priority: SignalPriority::High,
                window: WindowType::Immediate,
            },
        );
        overrides.insert("energy.logged".to_string(), SignalClass::NoSignal);

        let classifier = SignalClassifier::new(ClassificationTable::with_overrides(&overrides));
        assert_eq!(
            classifier.classify("task.created"),
            Classification::Signal {
                priority: SignalPriority::High,
                window: WindowType::Immediate
            }
        );
        assert_eq!(classifier.classify("energy.logged"), Classification::NoSignal);
        assert!(matches!(classifier.classify("task.overdue"), Classification::Signal { .. }));
    }

    #[test]
    fn test_signal_class_toml_shape() {
        let class: SignalClass = toml::from_str(
            r#"
            kind = "signal"
            priority = "high"
            window = "daily_window"
        "#,
        )
        .unwrap();
        assert_eq!(
            class,
            SignalClass::Signal {
                priority: SignalPriority::High,
                window: WindowType::DailyWindow
            }
        );
    }
}
