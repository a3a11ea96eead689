//! Run retention: age-based expiry and per-task history caps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cronclaw_core::config::CleanupConfig;
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::types::TaskRunCount;
use cronclaw_core::lifecycle::{Health, Lifecycle};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::run_service::RunService;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Removed for being older than `max_age_secs`.
    pub expired: u64,
    /// Removed by the per-task cap.
    pub trimmed: u64,
}

/// Tasks inspected by a full retention pass.
const SUMMARY_LIMIT: usize = 10_000;

struct Retention {
    config: CleanupConfig,
    runs: Arc<RunService>,
}

impl Retention {
    fn chunk(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if self.config.max_age_secs > 0 {
            let max_age = i64::try_from(self.config.max_age_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX);
            report.expired = self.by_age(None, max_age, now).await?;
        }
        if self.config.max_per_task > 0 {
            report.trimmed = self.by_keep(None, self.config.max_per_task).await?;
        }
        if report.expired + report.trimmed > 0 {
            tracing::info!(
                "🧹 Run cleanup removed {} expired, {} over cap",
                report.expired,
                report.trimmed
            );
        }
        Ok(report)
    }

    async fn by_age(&self, task_id: Option<i64>, max_age: Duration, now: DateTime<Utc>) -> Result<u64> {
        if max_age <= Duration::zero() {
            return Err(CronClawError::InvalidArgument("max age must be positive".into()));
        }
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let chunk = self.chunk();
        let mut removed = 0;
        loop {
            let n = self.runs.delete_older_than(cutoff, task_id, chunk).await?;
            removed += n;
            if (n as usize) < chunk {
                return Ok(removed);
            }
            tokio::task::yield_now().await;
        }
    }

    async fn by_keep(&self, task_id: Option<i64>, keep: u32) -> Result<u64> {
        if let Some(task_id) = task_id {
            return self.keep_chunked(task_id, keep).await;
        }
        let mut removed = 0;
        for entry in self.runs.count_per_task(SUMMARY_LIMIT).await? {
            if entry.count <= u64::from(keep) {
                continue;
            }
            match self.keep_chunked(entry.task_id, keep).await {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!(task_id = entry.task_id, "⚠️ Trimming run history failed: {e}"),
            }
        }
        Ok(removed)
    }

    /// Delete a task's runs past its newest `keep`, one chunk of ids at a time.
    async fn keep_chunked(&self, task_id: i64, keep: u32) -> Result<u64> {
        let chunk = self.chunk();
        let mut removed = 0;
        loop {
            let ids = self.runs.list_ids_beyond(task_id, keep, chunk).await?;
            if ids.is_empty() {
                return Ok(removed);
            }
            removed += self.runs.delete_by_ids(&ids).await?;
            if ids.len() < chunk {
                return Ok(removed);
            }
            tokio::task::yield_now().await;
        }
    }
}

pub struct RunCleanup {
    retention: Arc<Retention>,
    loop_handle: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    running: AtomicBool,
}

impl RunCleanup {
    pub fn new(config: CleanupConfig, runs: Arc<RunService>) -> Self {
        Self {
            retention: Arc::new(Retention { config, runs }),
            loop_handle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Apply the configured retention once, as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        self.retention.run_once(now).await
    }

    /// Stored runs per task, largest first.
    pub async fn summary(&self, limit: usize) -> Result<Vec<TaskRunCount>> {
        self.retention.runs.count_per_task(limit).await
    }

    /// Delete runs scheduled more than `max_age` before `now`, of one task or all.
    pub async fn cleanup_by_age(&self, task_id: Option<i64>, max_age: Duration, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.retention.by_age(task_id, max_age, now).await?;
        tracing::info!(?task_id, "🧹 Removed {removed} run(s) older than {}s", max_age.num_seconds());
        Ok(removed)
    }

    /// Keep only the newest `keep` runs of one task or of every task.
    pub async fn cleanup_by_keep(&self, task_id: Option<i64>, keep: u32) -> Result<u64> {
        let removed = self.retention.by_keep(task_id, keep).await?;
        tracing::info!(?task_id, "🧹 Removed {removed} run(s) beyond the newest {keep}");
        Ok(removed)
    }

    pub async fn delete_runs(&self, ids: &[i64]) -> Result<u64> {
        let removed = self.retention.runs.delete_by_ids(ids).await?;
        tracing::info!("🗑️ Deleted {removed} run(s) by id");
        Ok(removed)
    }
}

#[async_trait]
impl Lifecycle for RunCleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn start(&self) -> Result<()> {
        if !self.retention.config.enabled {
            tracing::debug!("Run cleanup disabled");
            return Ok(());
        }
        let mut slot = self.loop_handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(cleanup_loop(self.retention.clone(), token.clone()));
        *slot = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("🧹 Run cleanup every {}s", self.retention.config.interval_secs);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some((token, handle)) = self.loop_handle.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Cleanup loop exited abnormally: {e}");
        }
        self.running.store(false, Ordering::SeqCst);
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

async fn cleanup_loop(retention: Arc<Retention>, token: CancellationToken) {
    let period = std::time::Duration::from_secs(retention.config.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = retention.run_once(Utc::now()).await {
                    tracing::error!("❌ Run cleanup failed: {e}");
                }
            }
        }
    }
}
