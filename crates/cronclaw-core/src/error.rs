//! Error types for CronClaw.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CronClawError>;

#[derive(Debug, Error)]
pub enum CronClawError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Version conflict on task {id}: expected version {expected}")]
    VersionConflict { id: i64, expected: i64 },

    #[error("Run already exists for task {task_id} at {scheduled_time}")]
    DuplicateRun {
        task_id: i64,
        scheduled_time: DateTime<Utc>,
    },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Run {run_id} is in status {status}")]
    InvalidState { run_id: i64, status: String },

    #[error("Concurrency limit reached for task {task_id}: {active}/{max}")]
    ConcurrencyLimit { task_id: i64, active: usize, max: u32 },

    #[error("Dispatch queue is full")]
    QueueFull,

    #[error("Executor is not running")]
    ExecutorStopped,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CronClawError {
    /// True for errors that mean "the row is not there".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::RunNotFound(_))
    }
}
