//! Core error types for nudgeflow-core.
//!
//! Errors that reach a caller are limited to lifecycle violations, storage
//! and configuration failures. Classification gaps, rule failures and
//! selector timeouts are degradation paths handled inside the pipeline and
//! never surface here.

use std::path::PathBuf;
use thiserror::Error;

use crate::recommendation::RecommendationStatus;

/// Core error type for nudgeflow-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid recommendation state transitions
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A pipeline run exceeded its overall budget and was abandoned
    #[error("Pipeline run for user '{user_id}' timed out after {timeout_ms} ms")]
    RunTimedOut { user_id: String, timeout_ms: u64 },

    /// The snapshot collaborator could not produce user state
    #[error("Snapshot assembly failed for user '{user_id}': {message}")]
    Snapshot { user_id: String, message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A signal was consumed by another run between selection and commit
    #[error("Signal consumption conflict: expected {expected} unconsumed signals, marked {marked}")]
    ConsumptionConflict { expected: usize, marked: usize },
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown configuration key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Failed to access the data directory
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
}

/// Rejected recommendation state transitions.
#[derive(Error, Debug, PartialEq)]
pub enum LifecycleError {
    /// No recommendation with this id
    #[error("Recommendation '{0}' not found")]
    NotFound(String),

    /// The action is not valid from the recommendation's current status
    #[error("Cannot {action} recommendation '{id}' while it is {from}")]
    InvalidTransition {
        id: String,
        from: RecommendationStatus,
        action: &'static str,
    },

    /// Execution was requested a second time
    #[error("Recommendation '{0}' has already been executed")]
    AlreadyExecuted(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Unparseable context key storage form
    #[error("Invalid context key '{0}'")]
    InvalidContextKey(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, value: &str) -> Self {
        ValidationError::InvalidValue {
            field: field.to_string(),
            message: format!("unrecognized value '{value}'"),
        }
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked
                    || err.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    DatabaseError::Locked
                } else {
                    DatabaseError::QueryFailed(err.to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Database(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
