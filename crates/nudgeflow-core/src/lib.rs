//! # Nudgeflow Core Library
//!
//! Turns a user's domain events into a small, ranked set of actionable
//! recommendations, and carries those recommendations through their
//! lifecycle.
//!
//! ## Architecture
//!
//! - **Signals**: domain events are classified into prioritized signals and
//!   buffered per user until their processing window closes
//! - **Rules**: a registry of deterministic rules evaluated against a
//!   point-in-time user snapshot
//! - **Escalation**: rules that only detect a situation are resolved through
//!   the playbook and then a pluggable tier-N selector, under timeouts
//! - **Lifecycle**: deduplicated, capped recommendations with accept, dismiss,
//!   snooze, expiry and execution
//! - **Traces**: one provenance record per decision, with selector usage
//! - **Storage**: SQLite persistence and TOML configuration
//!
//! ## Key Components
//!
//! - [`Pipeline`]: per-user orchestration of a run
//! - [`RuleEngine`]: rule registry and evaluation loop
//! - [`EscalationController`]: tier ladder and final ranking
//! - [`LifecycleManager`]: recommendation state machine
//! - [`Store`]: persistence
//! - [`Config`]: pipeline configuration

pub mod context;
pub mod error;
pub mod escalation;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod playbook;
pub mod recommendation;
pub mod rules;
pub mod signals;
pub mod snapshot;
pub mod storage;
pub mod trace;

pub use context::{BucketThresholds, CapacityBucket, ContextKey, DayTypeBucket, LevelBucket};
pub use error::{ConfigError, CoreError, DatabaseError, LifecycleError, ValidationError};
pub use escalation::{EscalationController, PoolRankingSelector, SelectionConfig, TierSelector};
pub use events::DomainEvent;
pub use executor::{EntityCommand, EntityCommands, ExecutionResult, Executor, RecordingCommands};
pub use pipeline::{DueRun, Pipeline, PipelineBuilder, RunReport};
pub use playbook::{InMemoryPlaybook, Playbook, PlaybookEntry, PlaybookPolicy, PlaybookReader};
pub use recommendation::{
    ActionKind, DirectRecommendationCandidate, LifecycleManager, Recommendation, RecommendationContext,
    RecommendationStatus, RecommendationType, TargetKind,
};
pub use rules::{Rule, RuleEngine, RuleInput, RuleResult, Severity};
pub use signals::{SignalClassifier, SignalEntry, SignalPriority, WindowAggregator, WindowType};
pub use snapshot::{SnapshotAssembler, StaticSnapshotAssembler, UserStateSnapshot};
pub use storage::{Config, Store};
pub use trace::{PageRequest, RecommendationTrace, SelectionMethod, TraceFilter, TracePage};
