//! Run Service: the run state machine's operations over a `RunStore`.
//!
//! Every mark returns `Ok(true)` when the run moved and `Ok(false)` when its
//! current status does not allow the move. Store failures are returned as-is.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::traits::RunStore;
use cronclaw_core::types::{
    NewRun, Run, RunFilter, RunStats, RunStatus, RunTransition, TaskRunCount,
};

pub struct RunService {
    store: Arc<dyn RunStore>,
}

impl RunService {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn create_scheduled(&self, run: &NewRun) -> Result<Run> {
        let created = self.store.create_scheduled(run).await?;
        tracing::debug!(
            run_id = created.id,
            task_id = created.task_id,
            "🆕 Run scheduled for {}",
            created.scheduled_time
        );
        Ok(created)
    }

    /// Create a run and immediately close it as a never-dispatched placeholder.
    pub async fn create_placeholder(&self, run: &NewRun, kind: RunStatus, reason: &str) -> Result<Run> {
        if !kind.is_placeholder() {
            return Err(CronClawError::InvalidArgument(format!(
                "{kind} is not a placeholder status"
            )));
        }
        let created = self.store.create_scheduled(run).await?;
        self.mark_skipped(created.id, kind, reason).await?;
        tracing::info!(
            run_id = created.id,
            task_id = created.task_id,
            "⏭️ {kind} at {} ({reason})",
            created.scheduled_time
        );
        Ok(Run {
            status: kind,
            error_message: Some(reason.to_string()),
            ..created
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<Run>> {
        self.store.get(id).await
    }

    pub async fn require(&self, id: i64) -> Result<Run> {
        self.store.get(id).await?.ok_or(CronClawError::RunNotFound(id))
    }

    pub async fn exists_at(&self, task_id: i64, scheduled_time: DateTime<Utc>) -> Result<bool> {
        self.store.exists_at(task_id, scheduled_time).await
    }

    /// Atomic claim: succeeds for exactly one caller per run.
    pub async fn transition_to_running(&self, id: i64) -> Result<bool> {
        self.apply(id, RunTransition::to(RunStatus::Running).started_at(Utc::now())).await
    }

    pub async fn mark_success(&self, id: i64, code: i32, body: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::Success)
            .ended_at(Utc::now())
            .with_response(code, body);
        self.apply(id, change).await
    }

    pub async fn mark_failed(&self, id: i64, response: Option<(i32, &str)>, message: &str) -> Result<bool> {
        let mut change = RunTransition::to(RunStatus::Failed)
            .ended_at(Utc::now())
            .with_error(message);
        if let Some((code, body)) = response {
            change = change.with_response(code, body);
        }
        self.apply(id, change).await
    }

    pub async fn mark_timeout(&self, id: i64, message: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::Timeout)
            .ended_at(Utc::now())
            .with_error(message);
        self.apply(id, change).await
    }

    pub async fn mark_canceled(&self, id: i64, message: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::Canceled)
            .ended_at(Utc::now())
            .with_error(message);
        self.apply(id, change).await
    }

    /// Close a SCHEDULED run as one of the *_SKIP statuses.
    pub async fn mark_skipped(&self, id: i64, kind: RunStatus, reason: &str) -> Result<bool> {
        if !kind.is_placeholder() {
            return Err(CronClawError::InvalidArgument(format!(
                "{kind} is not a skip status"
            )));
        }
        let change = RunTransition::to(kind).ended_at(Utc::now()).with_error(reason);
        self.apply(id, change).await
    }

    /// Returns the generated callback token when the run moved.
    pub async fn mark_callback_pending(
        &self,
        id: i64,
        code: i32,
        body: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let change = RunTransition::to(RunStatus::CallbackPending)
            .with_response(code, body)
            .with_callback(token.clone(), deadline);
        Ok(self.apply(id, change).await?.then_some(token))
    }

    pub async fn mark_callback_success(&self, id: i64, code: i32, body: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::Success)
            .ended_at(Utc::now())
            .with_response(code, body);
        self.apply_from(id, change, RunStatus::CallbackPending).await
    }

    pub async fn mark_callback_failed(&self, id: i64, message: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::CallbackFailed)
            .ended_at(Utc::now())
            .with_error(message);
        self.apply(id, change).await
    }

    pub async fn mark_failed_timeout(&self, id: i64, message: &str) -> Result<bool> {
        let change = RunTransition::to(RunStatus::FailedTimeout)
            .ended_at(Utc::now())
            .with_error(message);
        self.apply(id, change).await
    }

    pub async fn record_request(&self, id: i64, snapshot: &str) -> Result<()> {
        self.store.update_request_snapshot(id, snapshot).await
    }

    pub async fn list_by_task(&self, task_id: i64, filter: &RunFilter, limit: usize, offset: usize) -> Result<Vec<Run>> {
        self.store.list_by_task(task_id, filter, limit, offset).await
    }

    pub async fn list_active(&self, limit: usize, offset: usize) -> Result<Vec<Run>> {
        self.store.list_active(limit, offset).await
    }

    pub async fn list_callback_pending_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        self.store.list_callback_pending_expired(now, limit).await
    }

    pub async fn list_sync_running_stuck(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        self.store.list_sync_running_stuck(stale_before, limit).await
    }

    pub async fn list_by_ids(&self, ids: &[i64]) -> Result<Vec<Run>> {
        self.store.list_by_ids(ids).await
    }

    /// Delete up to `limit` runs scheduled before `cutoff`.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>, task_id: Option<i64>, limit: usize) -> Result<u64> {
        self.store.delete_older_than(cutoff, task_id, limit).await
    }

    pub async fn count_per_task(&self, limit: usize) -> Result<Vec<TaskRunCount>> {
        self.store.count_per_task(limit).await
    }

    /// Ids of a task's runs past its newest `keep`.
    pub async fn list_ids_beyond(&self, task_id: i64, keep: u32, limit: usize) -> Result<Vec<i64>> {
        self.store.list_ids_beyond(task_id, keep, limit).await
    }

    pub async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        self.store.delete_by_ids(ids).await
    }

    /// Status distribution, ratios and average latencies of one task's runs.
    pub async fn stats(&self, task_id: i64) -> Result<RunStats> {
        let counts = self.store.count_status_by_task(task_id).await?;
        let latency = self.store.latency_by_task(task_id).await?;
        let total: u64 = counts.iter().map(|c| c.count).sum();
        let mut stats = RunStats {
            task_id,
            total,
            latency,
            ..Default::default()
        };
        let (mut success, mut failure) = (0u64, 0u64);
        for c in &counts {
            if c.status == RunStatus::Success {
                success += c.count;
            } else if c.status.is_failure() || c.status == RunStatus::CallbackFailed {
                failure += c.count;
            }
            stats.counts.insert(c.status.to_string(), c.count);
            stats.ratios.insert(c.status.to_string(), ratio(c.count, total));
        }
        stats.success_rate = ratio(success, total);
        stats.failure_rate = ratio(failure, total);
        Ok(stats)
    }

    async fn apply(&self, id: i64, change: RunTransition) -> Result<bool> {
        let status = change.status;
        let moved = self.store.transition(id, &change).await.inspect_err(|e| {
            tracing::error!(run_id = id, "❌ Failed to mark run {status}: {e}");
        })?;
        if !moved {
            tracing::debug!(run_id = id, "Run not in a state that allows {status}");
        }
        Ok(moved)
    }

    /// Like `apply`, but only from one specific source status.
    async fn apply_from(&self, id: i64, change: RunTransition, from: RunStatus) -> Result<bool> {
        match self.store.get(id).await? {
            Some(run) if run.status == from => self.apply(id, change).await,
            Some(_) => Ok(false),
            None => Err(CronClawError::RunNotFound(id)),
        }
    }
}

fn ratio(n: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { n as f64 / total as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cronclaw_core::types::Task;
    use cronclaw_db::SqliteStore;

    fn service() -> RunService {
        RunService::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn new_run(second: u32) -> NewRun {
        let mut task = Task::new("t", "* * * * * *", "svc", "/");
        task.id = 1;
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, second).unwrap();
        NewRun::for_task(&task, at, 1).unwrap()
    }

    #[tokio::test]
    async fn test_claim_exclusive_under_contention() {
        let svc = Arc::new(service());
        let run = svc.create_scheduled(&new_run(0)).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { svc.transition_to_running(run.id).await.unwrap() }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_sync_lifecycle() {
        let svc = service();
        let run = svc.create_scheduled(&new_run(0)).await.unwrap();
        assert!(!svc.mark_success(run.id, 200, "ok").await.unwrap());
        assert!(svc.transition_to_running(run.id).await.unwrap());
        assert!(svc.mark_success(run.id, 200, "ok").await.unwrap());
        assert!(!svc.mark_canceled(run.id, "late").await.unwrap());
        let run = svc.require(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.response_body.as_deref(), Some("ok"));
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn test_async_lifecycle() {
        let svc = service();
        let run = svc.create_scheduled(&new_run(0)).await.unwrap();
        svc.transition_to_running(run.id).await.unwrap();
        let deadline = Utc::now() + Duration::minutes(5);
        let token = svc.mark_callback_pending(run.id, 202, "accepted", deadline).await.unwrap();
        assert!(token.is_some());
        assert!(svc.mark_callback_success(run.id, 200, "done").await.unwrap());
        assert!(!svc.mark_failed_timeout(run.id, "late").await.unwrap());

        // Callback success only applies to CALLBACK_PENDING, not RUNNING
        let other = svc.create_scheduled(&new_run(1)).await.unwrap();
        svc.transition_to_running(other.id).await.unwrap();
        assert!(!svc.mark_callback_success(other.id, 200, "").await.unwrap());
        assert!(svc.mark_callback_success(999, 200, "").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_placeholder() {
        let svc = service();
        let run = svc
            .create_placeholder(&new_run(0), RunStatus::OverlapSkip, "previous run still pending")
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::OverlapSkip);
        assert_eq!(svc.require(run.id).await.unwrap().status, RunStatus::OverlapSkip);
        assert!(svc
            .create_placeholder(&new_run(1), RunStatus::Failed, "x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let svc = service();
        for s in 0..4 {
            let run = svc.create_scheduled(&new_run(s)).await.unwrap();
            svc.transition_to_running(run.id).await.unwrap();
            if s == 0 {
                svc.mark_failed(run.id, Some((500, "boom")), "500; body=boom").await.unwrap();
            } else {
                svc.mark_success(run.id, 200, "").await.unwrap();
            }
        }
        let stats = svc.stats(1).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.counts.get("SUCCESS"), Some(&3));
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((stats.failure_rate - 0.25).abs() < f64::EPSILON);
        assert!(stats.latency.avg_exec_ms.is_some());
    }
}
