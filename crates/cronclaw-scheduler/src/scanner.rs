//! Reconciliation Scanner: periodic sweeps over expired callbacks, stuck
//! synchronous runs and stale progress.
//!
//! Every sweep is idempotent and bounded by `scanner.batch_limit` per tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cronclaw_core::config::ScannerConfig;
use cronclaw_core::error::Result;
use cronclaw_core::lifecycle::{Health, Lifecycle};
use cronclaw_core::types::Run;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressTracker;
use crate::run_service::RunService;

/// Counters for one scanner tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub callback_timeouts: usize,
    pub stuck_sync: usize,
    pub progress_cleared: usize,
    pub progress_expired: usize,
    pub errors: usize,
}

impl SweepReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

struct Sweeps {
    config: ScannerConfig,
    runs: Arc<RunService>,
    progress: Arc<ProgressTracker>,
}

pub struct RunScanner {
    sweeps: Arc<Sweeps>,
    loop_handle: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    running: AtomicBool,
}

impl RunScanner {
    pub fn new(config: ScannerConfig, runs: Arc<RunService>, progress: Arc<ProgressTracker>) -> Self {
        Self {
            sweeps: Arc::new(Sweeps { config, runs, progress }),
            loop_handle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Run every sweep once as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> SweepReport {
        self.sweeps.tick(now).await
    }
}

impl Sweeps {
    async fn tick(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sweep_callback_timeouts(now, &mut report.errors).await {
            Ok(n) => report.callback_timeouts = n,
            Err(e) => {
                tracing::error!("❌ Callback-timeout sweep failed: {e}");
                report.errors += 1;
            }
        }
        match self.sweep_stuck_sync(now, &mut report.errors).await {
            Ok(n) => report.stuck_sync = n,
            Err(e) => {
                tracing::error!("❌ Stuck-sync sweep failed: {e}");
                report.errors += 1;
            }
        }
        match self.sweep_progress(now).await {
            Ok(n) => report.progress_cleared = n,
            Err(e) => {
                tracing::error!("❌ Progress cleanup failed: {e}");
                report.errors += 1;
            }
        }
        if self.config.progress_ttl_secs > 0 {
            let ttl = Duration::seconds(self.config.progress_ttl_secs as i64);
            report.progress_expired = self.progress.sweep_older_than(ttl, now);
        }

        if !report.is_quiet() {
            tracing::info!("🧹 Reconciliation: {report:?}");
        }
        report
    }

    fn batch_limit(&self) -> usize {
        self.config.batch_limit.max(1)
    }

    /// A failing row is logged and counted in `errors`; the rest of the batch still runs.
    async fn sweep_callback_timeouts(&self, now: DateTime<Utc>, errors: &mut usize) -> Result<usize> {
        let expired = self.runs.list_callback_pending_expired(now, self.batch_limit()).await?;
        let mut marked = 0;
        for run in expired {
            match self.runs.mark_failed_timeout(run.id, "callback_deadline_exceeded").await {
                Ok(true) => {
                    tracing::warn!(run_id = run.id, task_id = run.task_id, "⌛ Callback deadline passed");
                    marked += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(run_id = run.id, "❌ Failed to time out callback: {e}");
                    *errors += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn sweep_stuck_sync(&self, now: DateTime<Utc>, errors: &mut usize) -> Result<usize> {
        let secs = self.config.sync_run_stuck_timeout_secs;
        if secs == 0 {
            return Ok(0);
        }
        let stale_before = now - Duration::seconds(secs as i64);
        let stuck = self.runs.list_sync_running_stuck(stale_before, self.batch_limit()).await?;
        let mut marked = 0;
        for run in stuck {
            match self.runs.mark_timeout(run.id, "sync_run_stuck_timeout").await {
                Ok(true) => {
                    tracing::warn!(run_id = run.id, task_id = run.task_id, "⌛ Sync run stuck since {:?}", run.start_time);
                    marked += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(run_id = run.id, "❌ Failed to time out stuck run: {e}");
                    *errors += 1;
                }
            }
        }
        Ok(marked)
    }

    /// Clear progress of runs that are gone or terminal past the grace period.
    async fn sweep_progress(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids = self.progress.tracked_ids();
        if ids.is_empty() {
            return Ok(0);
        }
        let grace = Duration::seconds(self.config.progress_cleanup_grace_secs as i64);
        let mut cleared = 0;
        for chunk in ids.chunks(self.batch_limit()) {
            let runs = self.runs.list_by_ids(chunk).await?;
            let by_id: HashMap<i64, &Run> = runs.iter().map(|r| (r.id, r)).collect();
            for id in chunk {
                let done = match by_id.get(id) {
                    None => true,
                    Some(run) if run.status.is_terminal() => {
                        grace.is_zero() || run.end_time.is_none_or(|end| now - end >= grace)
                    }
                    Some(_) => false,
                };
                if done && self.progress.clear(*id) {
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl Lifecycle for RunScanner {
    fn name(&self) -> &'static str {
        "scanner"
    }

    async fn start(&self) -> Result<()> {
        let mut slot = self.loop_handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(self.sweeps.clone(), token.clone()));
        *slot = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("🔎 Reconciliation scanner started (every {}s)", self.sweeps.config.interval_secs);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some((token, handle)) = self.loop_handle.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Scanner loop exited abnormally: {e}");
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("⏹️ Reconciliation scanner stopped");
        Ok(())
    }

    fn health(&self) -> Health {
        if self.running.load(Ordering::SeqCst) {
            Health::Healthy
        } else {
            Health::Inactive
        }
    }
}

async fn sweep_loop(sweeps: Arc<Sweeps>, token: CancellationToken) {
    let period = std::time::Duration::from_secs(sweeps.config.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                sweeps.tick(Utc::now()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cronclaw_core::error::CronClawError;
    use cronclaw_core::traits::RunStore;
    use cronclaw_core::types::{
        ExecType, LatencyStats, NewRun, RunFilter, RunStatus, RunTransition, StatusCount, Task,
        TaskRunCount,
    };
    use cronclaw_db::SqliteStore;
    use std::sync::atomic::AtomicI64;

    struct Fixture {
        scanner: RunScanner,
        runs: Arc<RunService>,
        progress: Arc<ProgressTracker>,
    }

    fn fixture(configure: impl FnOnce(&mut ScannerConfig)) -> Fixture {
        let mut config = ScannerConfig::default();
        configure(&mut config);
        let runs = Arc::new(RunService::new(Arc::new(SqliteStore::open_in_memory().unwrap())));
        let progress = Arc::new(ProgressTracker::new());
        Fixture {
            scanner: RunScanner::new(config, runs.clone(), progress.clone()),
            runs,
            progress,
        }
    }

    async fn running(f: &Fixture, second: u32, exec_type: ExecType) -> Run {
        let mut task = Task::new("t", "* * * * * *", "svc", "/");
        task.id = 1;
        task.exec_type = exec_type;
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, second).unwrap();
        let run = f.runs.create_scheduled(&NewRun::for_task(&task, at, 1).unwrap()).await.unwrap();
        assert!(f.runs.transition_to_running(run.id).await.unwrap());
        run
    }

    async fn status(f: &Fixture, id: i64) -> RunStatus {
        f.runs.require(id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_expired_callbacks_fail_timeout() {
        let f = fixture(|_| {});
        let now = Utc::now();
        let expired = running(&f, 0, ExecType::Async).await;
        let live = running(&f, 1, ExecType::Async).await;
        f.runs.mark_callback_pending(expired.id, 202, "", now - Duration::seconds(5)).await.unwrap();
        f.runs.mark_callback_pending(live.id, 202, "", now + Duration::minutes(5)).await.unwrap();

        let report = f.scanner.tick(now).await;
        assert_eq!(report.callback_timeouts, 1);
        assert_eq!(status(&f, expired.id).await, RunStatus::FailedTimeout);
        assert_eq!(status(&f, live.id).await, RunStatus::CallbackPending);

        // A second pass finds nothing
        assert_eq!(f.scanner.tick(now).await.callback_timeouts, 0);
    }

    #[tokio::test]
    async fn test_stuck_sync_sweep_is_toggled() {
        let later = Utc::now() + Duration::hours(1);

        let off = fixture(|_| {});
        let run = running(&off, 0, ExecType::Sync).await;
        assert_eq!(off.scanner.tick(later).await.stuck_sync, 0);
        assert_eq!(status(&off, run.id).await, RunStatus::Running);

        let on = fixture(|c| c.sync_run_stuck_timeout_secs = 60);
        let sync = running(&on, 0, ExecType::Sync).await;
        let asynchronous = running(&on, 1, ExecType::Async).await;
        assert_eq!(on.scanner.tick(Utc::now()).await.stuck_sync, 0);
        assert_eq!(on.scanner.tick(later).await.stuck_sync, 1);
        let stuck = on.runs.require(sync.id).await.unwrap();
        assert_eq!(stuck.status, RunStatus::Timeout);
        assert_eq!(stuck.error_message.as_deref(), Some("sync_run_stuck_timeout"));
        assert_eq!(status(&on, asynchronous.id).await, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_progress_cleared_for_terminal_and_missing_runs() {
        let f = fixture(|_| {});
        let done = running(&f, 0, ExecType::Sync).await;
        let active = running(&f, 1, ExecType::Sync).await;
        f.runs.mark_success(done.id, 200, "ok").await.unwrap();
        f.progress.set(done.id, 1, 1, "");
        f.progress.set(active.id, 1, 2, "");
        f.progress.set(9999, 1, 2, "");

        let report = f.scanner.tick(Utc::now()).await;
        assert_eq!(report.progress_cleared, 2);
        assert_eq!(f.progress.tracked_ids(), vec![active.id]);
    }

    #[tokio::test]
    async fn test_progress_grace_period() {
        let f = fixture(|c| {
            c.progress_cleanup_grace_secs = 60;
            c.batch_limit = 1;
        });
        let done = running(&f, 0, ExecType::Sync).await;
        f.runs.mark_failed(done.id, None, "boom").await.unwrap();
        f.progress.set(done.id, 1, 2, "");

        assert_eq!(f.scanner.tick(Utc::now()).await.progress_cleared, 0);
        let report = f.scanner.tick(Utc::now() + Duration::minutes(2)).await;
        assert_eq!(report.progress_cleared, 1);
        assert!(f.progress.is_empty());
    }

    #[tokio::test]
    async fn test_progress_ttl_safety_net() {
        let f = fixture(|c| c.progress_ttl_secs = 60);
        let active = running(&f, 0, ExecType::Sync).await;
        f.progress.set(active.id, 1, 2, "");
        let report = f.scanner.tick(Utc::now() + Duration::minutes(5)).await;
        assert_eq!(report.progress_expired, 1);
        assert!(f.progress.is_empty());
    }

    /// SQLite store whose status writes fail for one run.
    struct OneBrokenRow {
        inner: SqliteStore,
        broken: AtomicI64,
    }

    #[async_trait]
    impl RunStore for OneBrokenRow {
        async fn create_scheduled(&self, run: &NewRun) -> Result<Run> {
            self.inner.create_scheduled(run).await
        }
        async fn get(&self, id: i64) -> Result<Option<Run>> {
            self.inner.get(id).await
        }
        async fn exists_at(&self, task_id: i64, at: DateTime<Utc>) -> Result<bool> {
            self.inner.exists_at(task_id, at).await
        }
        async fn transition(&self, id: i64, change: &RunTransition) -> Result<bool> {
            if id == self.broken.load(Ordering::SeqCst) {
                return Err(CronClawError::Database("disk I/O error".into()));
            }
            self.inner.transition(id, change).await
        }
        async fn list_by_task(&self, task_id: i64, filter: &RunFilter, limit: usize, offset: usize) -> Result<Vec<Run>> {
            self.inner.list_by_task(task_id, filter, limit, offset).await
        }
        async fn list_active(&self, limit: usize, offset: usize) -> Result<Vec<Run>> {
            self.inner.list_active(limit, offset).await
        }
        async fn list_callback_pending_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
            self.inner.list_callback_pending_expired(now, limit).await
        }
        async fn list_sync_running_stuck(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
            self.inner.list_sync_running_stuck(stale_before, limit).await
        }
        async fn list_by_ids(&self, ids: &[i64]) -> Result<Vec<Run>> {
            self.inner.list_by_ids(ids).await
        }
        async fn count_status_by_task(&self, task_id: i64) -> Result<Vec<StatusCount>> {
            self.inner.count_status_by_task(task_id).await
        }
        async fn latency_by_task(&self, task_id: i64) -> Result<LatencyStats> {
            self.inner.latency_by_task(task_id).await
        }
        async fn update_request_snapshot(&self, id: i64, snapshot: &str) -> Result<()> {
            self.inner.update_request_snapshot(id, snapshot).await
        }
        async fn count_per_task(&self, limit: usize) -> Result<Vec<TaskRunCount>> {
            self.inner.count_per_task(limit).await
        }
        async fn delete_older_than(&self, cutoff: DateTime<Utc>, task_id: Option<i64>, limit: usize) -> Result<u64> {
            self.inner.delete_older_than(cutoff, task_id, limit).await
        }
        async fn list_ids_beyond(&self, task_id: i64, keep: u32, limit: usize) -> Result<Vec<i64>> {
            self.inner.list_ids_beyond(task_id, keep, limit).await
        }
        async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
            self.inner.delete_by_ids(ids).await
        }
    }

    #[tokio::test]
    async fn test_failing_row_does_not_starve_the_batch() {
        let store = Arc::new(OneBrokenRow {
            inner: SqliteStore::open_in_memory().unwrap(),
            broken: AtomicI64::new(0),
        });
        let runs = Arc::new(RunService::new(store.clone()));
        let config = ScannerConfig { sync_run_stuck_timeout_secs: 60, ..Default::default() };
        let f = Fixture {
            scanner: RunScanner::new(config, runs.clone(), Arc::new(ProgressTracker::new())),
            runs,
            progress: Arc::new(ProgressTracker::new()),
        };
        let now = Utc::now();
        let first = running(&f, 0, ExecType::Async).await;
        let second = running(&f, 1, ExecType::Async).await;
        // Earliest deadline first, so the broken row leads the batch
        f.runs.mark_callback_pending(first.id, 202, "", now - Duration::seconds(10)).await.unwrap();
        f.runs.mark_callback_pending(second.id, 202, "", now - Duration::seconds(5)).await.unwrap();
        let stuck_a = running(&f, 2, ExecType::Sync).await;
        let stuck_b = running(&f, 3, ExecType::Sync).await;
        store.broken.store(first.id, Ordering::SeqCst);

        let later = now + Duration::hours(1);
        let report = f.scanner.tick(later).await;
        assert_eq!(report.callback_timeouts, 1);
        assert_eq!(report.errors, 1);
        assert_eq!(status(&f, first.id).await, RunStatus::CallbackPending);
        assert_eq!(status(&f, second.id).await, RunStatus::FailedTimeout);
        assert_eq!(report.stuck_sync, 2);
        assert_eq!(status(&f, stuck_a.id).await, RunStatus::Timeout);
        assert_eq!(status(&f, stuck_b.id).await, RunStatus::Timeout);

        store.broken.store(stuck_a.id, Ordering::SeqCst);
        let report = f.scanner.tick(later).await;
        assert_eq!(report.callback_timeouts, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(status(&f, first.id).await, RunStatus::FailedTimeout);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let f = fixture(|_| {});
        f.scanner.start().await.unwrap();
        assert!(f.scanner.health().is_healthy());
        f.scanner.stop().await.unwrap();
        f.scanner.stop().await.unwrap();
        assert_eq!(f.scanner.health(), Health::Inactive);
    }
}
