//! Task and run store traits.
//!
//! Backends own the storage technology; the scheduler only relies on the
//! contracts documented here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    LatencyStats, NewRun, Run, RunFilter, RunTransition, StatusCount, Task, TaskFilter,
    TaskRunCount, TaskStatus,
};

/// Persistent task definitions. Soft-deleted tasks are invisible to every read.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task and return its id. Version starts at 1.
    async fn create(&self, task: &Task) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<Option<Task>>;

    async fn list_enabled(&self) -> Result<Vec<Task>>;

    async fn list_filtered(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<Vec<Task>>;

    async fn count_filtered(&self, filter: &TaskFilter) -> Result<u64>;

    /// Update every mutable field except status, only if `task.version` matches.
    /// Returns the new version. Fails with `VersionConflict` on a mismatch and
    /// `TaskNotFound` when the row is missing.
    async fn update_meta(&self, task: &Task) -> Result<i64>;

    /// Toggle status and bump the version. Returns the new version.
    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<i64>;

    async fn soft_delete(&self, id: i64) -> Result<()>;
}

/// Persistent run records.
///
/// Every method taking a `RunTransition` applies it only when the run's
/// current status may move to the target status, and returns whether a row
/// changed. A `false` is a no-op, never an error.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a SCHEDULED run. Fails with `DuplicateRun` when a run already
    /// exists for the same task and scheduled time.
    async fn create_scheduled(&self, run: &NewRun) -> Result<Run>;

    async fn get(&self, id: i64) -> Result<Option<Run>>;

    async fn exists_at(&self, task_id: i64, scheduled_time: DateTime<Utc>) -> Result<bool>;

    async fn transition(&self, id: i64, change: &RunTransition) -> Result<bool>;

    /// Newest first by scheduled time.
    async fn list_by_task(&self, task_id: i64, filter: &RunFilter, limit: usize, offset: usize) -> Result<Vec<Run>>;

    /// Runs in SCHEDULED, RUNNING or CALLBACK_PENDING, oldest first.
    async fn list_active(&self, limit: usize, offset: usize) -> Result<Vec<Run>>;

    async fn list_callback_pending_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>>;

    /// RUNNING sync runs whose start time and last update are both before `stale_before`.
    async fn list_sync_running_stuck(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Run>>;

    async fn list_by_ids(&self, ids: &[i64]) -> Result<Vec<Run>>;

    async fn count_status_by_task(&self, task_id: i64) -> Result<Vec<StatusCount>>;

    async fn latency_by_task(&self, task_id: i64) -> Result<LatencyStats>;

    async fn update_request_snapshot(&self, id: i64, snapshot: &str) -> Result<()>;

    /// Stored runs per task, largest first, at most `limit` tasks.
    async fn count_per_task(&self, limit: usize) -> Result<Vec<TaskRunCount>>;

    /// Delete at most `limit` runs scheduled before `cutoff`, optionally of
    /// one task only. Returns rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, task_id: Option<i64>, limit: usize) -> Result<u64>;

    /// Ids of a task's runs beyond its newest `keep`, newest first, at most `limit`.
    async fn list_ids_beyond(&self, task_id: i64, keep: u32, limit: usize) -> Result<Vec<i64>>;

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64>;
}
