//! Scan Engine: the main loop that turns cron matches into runs.
//! Uses tokio::interval; each tick sweeps the window `(last_scan, now]`.
//!
//! Per due instant:
//! dedupe → overlap policy → failure policy → concurrency policy → create + enqueue.
//! The engine never waits on an outbound call; it only enqueues.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Offset, SubsecRound, Utc};
use cronclaw_core::config::SchedulerConfig;
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::lifecycle::{Health, Lifecycle};
use cronclaw_core::types::{
    ConcurrencyPolicy, FailureAction, MisfirePolicy, NewRun, OverlapAction, Run, RunFilter,
    RunStatus, Task,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cron::{CronSchedule, parse_timezone};
use crate::executor::Dispatcher;
use crate::run_service::RunService;
use crate::task_cache::TaskCache;

/// What happened to one due instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    Dispatched,
    /// A run already exists at this instant.
    Duplicate,
    OverlapSkipped,
    FailureSkipped,
    ConcurrencySkipped,
    /// No run recorded (QUEUE policy at the cap) or the enqueue failed.
    Dropped,
    Error,
}

/// Counters for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub tasks: usize,
    pub due: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub errors: usize,
}

impl ScanReport {
    fn record(&mut self, decision: FireDecision) {
        match decision {
            FireDecision::Dispatched => self.dispatched += 1,
            FireDecision::Duplicate => self.duplicates += 1,
            FireDecision::OverlapSkipped
            | FireDecision::FailureSkipped
            | FireDecision::ConcurrencySkipped => self.skipped += 1,
            FireDecision::Dropped => self.dropped += 1,
            FireDecision::Error => self.errors += 1,
        }
    }
}

/// Resets the scan guard flag when a scan ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Scan state shared between the engine and its background loop.
struct ScanCore {
    config: SchedulerConfig,
    tasks: Arc<TaskCache>,
    runs: Arc<RunService>,
    dispatcher: Arc<dyn Dispatcher>,
    last_scan: Mutex<Option<DateTime<Utc>>>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    scanning: AtomicBool,
    /// Parsed schedules keyed by task id, re-parsed when the expression changes.
    schedules: Mutex<HashMap<i64, Arc<CronSchedule>>>,
}

pub struct SchedulerEngine {
    core: Arc<ScanCore>,
    loop_handle: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    running: AtomicBool,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        tasks: Arc<TaskCache>,
        runs: Arc<RunService>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            core: Arc::new(ScanCore {
                config,
                tasks,
                runs,
                dispatcher,
                last_scan: Mutex::new(None),
                last_refresh: Mutex::new(None),
                scanning: AtomicBool::new(false),
                schedules: Mutex::new(HashMap::new()),
            }),
            loop_handle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        *self.core.last_scan.lock()
    }

    /// Scan up to the current second.
    pub async fn scan(&self) -> ScanReport {
        self.core.scan_at(Utc::now()).await
    }

    /// Scan the window ending at `now`. Returns an empty report when another
    /// scan is already in progress.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        self.core.scan_at(now).await
    }

    /// Decide and act on one due instant.
    pub async fn fire(&self, task: &Task, instant: DateTime<Utc>) -> Result<FireDecision> {
        self.core.fire(task, instant).await
    }
}

impl ScanCore {
    async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();
        if self.scanning.swap(true, Ordering::SeqCst) {
            tracing::debug!("Scan already in progress, skipping tick");
            return report;
        }
        let _guard = ScanGuard(&self.scanning);

        let now = now.trunc_subsecs(0);
        self.refresh_tasks(now).await;
        let (from, until) = self.window(now);
        let tasks = self.tasks.list_enabled();
        report.tasks = tasks.len();

        for task in tasks {
            let due = match self.due_instants(&task, from, until) {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(task_id = task.id, "⚠️ Skipping task '{}': {e}", task.name);
                    report.errors += 1;
                    continue;
                }
            };
            report.due += due.len();
            for instant in due {
                let decision = match self.fire(&task, instant).await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!(task_id = task.id, "❌ Firing at {instant} failed: {e}");
                        FireDecision::Error
                    }
                };
                report.record(decision);
            }
        }

        *self.last_scan.lock() = Some(until);
        if report.due > 0 {
            tracing::debug!("🔍 Scan ({from}, {until}]: {report:?}");
        }
        report
    }

    /// `(from, until]`, with `from` clamped to `max_window_factor` poll intervals.
    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let poll_ms = self.config.poll_interval_ms.max(1);
        let span_ms = poll_ms.saturating_mul(u64::from(self.config.max_window_factor.max(1)));
        let widest = millis_before(now, span_ms);
        let last = *self.last_scan.lock();
        let from = last.unwrap_or_else(|| millis_before(now, poll_ms)).trunc_subsecs(0);
        (from.max(widest.trunc_subsecs(0)), now)
    }

    /// Reload the enabled set when `task_refresh_secs` has passed since the last reload.
    async fn refresh_tasks(&self, now: DateTime<Utc>) {
        let every = self.config.task_refresh_secs;
        if every == 0 {
            return;
        }
        let every = i64::try_from(every)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        {
            let mut last = self.last_refresh.lock();
            if let Some(at) = *last
                && (now - at).abs() < every
            {
                return;
            }
            *last = Some(now);
        }
        match self.tasks.refresh().await {
            Ok(n) => tracing::debug!("🔄 Task cache refreshed: {n} enabled"),
            Err(e) => tracing::warn!("⚠️ Task cache refresh failed: {e}"),
        }
    }

    /// Matching instants after misfire policy and the batch limit, oldest first.
    fn due_instants(
        &self,
        task: &Task,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let schedule = self.schedule_for(task)?;
        let tz = timezone_for(task);
        let mut due = schedule.due_instants(&tz, from, until);

        match task.misfire_policy {
            MisfirePolicy::FireNow => {}
            MisfirePolicy::Skip => due.retain(|t| *t == until),
            MisfirePolicy::CatchUpLimited => {
                let keep = (task.catchup_limit.max(1) as usize).min(due.len());
                due.drain(..due.len() - keep);
            }
        }
        let limit = self.config.batch_limit;
        if limit > 0 && due.len() > limit {
            due.drain(..due.len() - limit);
        }
        Ok(due)
    }

    fn schedule_for(&self, task: &Task) -> Result<Arc<CronSchedule>> {
        let mut schedules = self.schedules.lock();
        if let Some(s) = schedules.get(&task.id)
            && s.expression() == task.cron_expr
        {
            return Ok(s.clone());
        }
        let parsed = Arc::new(CronSchedule::parse(&task.cron_expr)?);
        schedules.insert(task.id, parsed.clone());
        Ok(parsed)
    }

    async fn fire(&self, task: &Task, instant: DateTime<Utc>) -> Result<FireDecision> {
        if self.runs.exists_at(task.id, instant).await? {
            return Ok(FireDecision::Duplicate);
        }

        let recent = self
            .runs
            .list_by_task(task.id, &RunFilter::default(), self.config.recent_runs_window.max(1), 0)
            .await?;

        // Overlap
        let pending: Vec<&Run> = recent
            .iter()
            .filter(|r| {
                matches!(r.status, RunStatus::Running | RunStatus::Scheduled)
                    && r.scheduled_time <= instant
            })
            .collect();
        let mut bypass_cap = false;
        if !pending.is_empty() {
            match task.overlap_action {
                OverlapAction::Skip => {
                    let new = NewRun::for_task(task, instant, 1)?;
                    return self
                        .placeholder(&new, RunStatus::OverlapSkip, "previous run still pending")
                        .await;
                }
                OverlapAction::CancelPrev => {
                    let holding = self.dispatcher.active_count(task.id);
                    let mut interrupted = 0;
                    for prev in pending.iter().filter(|r| r.status == RunStatus::Running) {
                        tracing::info!(task_id = task.id, run_id = prev.id, "🛑 Canceling previous run");
                        if self.dispatcher.cancel_run(prev.id) {
                            interrupted += 1;
                        } else {
                            self.runs.mark_canceled(prev.id, "canceled_by_overlap").await?;
                        }
                    }
                    if interrupted > 0 {
                        self.await_released(task.id, holding.saturating_sub(interrupted)).await;
                    }
                }
                OverlapAction::Parallel => bypass_cap = true,
                OverlapAction::Allow => {}
            }
        }

        // Failure chain
        let mut attempt = 1;
        let effective = recent
            .iter()
            .find(|r| !r.status.is_placeholder() && r.scheduled_time < instant);
        if let Some(last) = effective
            && last.status.is_failure()
        {
            match task.failure_action {
                FailureAction::Skip => {
                    let skip_attempt = last.attempt + 1;
                    let already_skipped = recent.iter().any(|r| {
                        r.status == RunStatus::FailureSkip
                            && r.attempt == skip_attempt
                            && r.scheduled_time > last.scheduled_time
                    });
                    if !already_skipped {
                        let new = NewRun::for_task(task, instant, skip_attempt)?;
                        return self
                            .placeholder(&new, RunStatus::FailureSkip, "previous run failed")
                            .await;
                    }
                    attempt = last.attempt + 2;
                }
                FailureAction::Retry => attempt = last.attempt + 1,
                FailureAction::RunNew => attempt = 1,
            }
        }

        // Concurrency cap
        if !bypass_cap {
            let active = self.dispatcher.active_count(task.id);
            let max = task.max_concurrency.max(1) as usize;
            if active >= max {
                match task.concurrency_policy {
                    ConcurrencyPolicy::Skip => {
                        let new = NewRun::for_task(task, instant, attempt)?;
                        return self
                            .placeholder(&new, RunStatus::ConcurrentSkip, "concurrency limit reached")
                            .await;
                    }
                    ConcurrencyPolicy::Parallel => bypass_cap = true,
                    ConcurrencyPolicy::Queue => {
                        // QUEUE is not a real queue yet; the firing is dropped
                        tracing::warn!(
                            task_id = task.id,
                            "⚠️ Concurrency limit {active}/{max} reached under QUEUE policy, dropping {instant}"
                        );
                        return Ok(FireDecision::Dropped);
                    }
                }
            }
        }

        let new = NewRun::for_task(task, instant, attempt)?;
        let run = match self.runs.create_scheduled(&new).await {
            Ok(run) => run,
            Err(CronClawError::DuplicateRun { .. }) => return Ok(FireDecision::Duplicate),
            Err(e) => return Err(e),
        };
        let run_id = run.id;
        if let Err(e) = self.dispatcher.enqueue(run, bypass_cap) {
            tracing::warn!(task_id = task.id, run_id, "⚠️ Enqueue failed: {e}");
            self.runs.mark_canceled(run_id, &format!("enqueue_failed: {e}")).await?;
            return Ok(FireDecision::Dropped);
        }
        tracing::info!(task_id = task.id, run_id, "⏰ Task '{}' fired for {instant} (attempt {attempt})", task.name);
        Ok(FireDecision::Dispatched)
    }

    /// Wait, at most `cancel_release_ms`, until the task's active count is
    /// down to `target` after interrupting its previous runs.
    async fn await_released(&self, task_id: i64, target: usize) {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(self.config.cancel_release_ms);
        while self.dispatcher.active_count(task_id) > target {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(task_id, "⚠️ Canceled runs still hold their slots");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn placeholder(&self, new: &NewRun, kind: RunStatus, reason: &str) -> Result<FireDecision> {
        match self.runs.create_placeholder(new, kind, reason).await {
            Ok(_) => Ok(match kind {
                RunStatus::OverlapSkip => FireDecision::OverlapSkipped,
                RunStatus::FailureSkip => FireDecision::FailureSkipped,
                _ => FireDecision::ConcurrencySkipped,
            }),
            Err(CronClawError::DuplicateRun { .. }) => Ok(FireDecision::Duplicate),
            Err(e) => Err(e),
        }
    }
}

fn millis_before(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    Duration::try_milliseconds(ms)
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn timezone_for(task: &Task) -> FixedOffset {
    parse_timezone(&task.timezone).unwrap_or_else(|| {
        tracing::warn!(task_id = task.id, "Unsupported timezone '{}', using UTC", task.timezone);
        Utc.fix()
    })
}

#[async_trait]
impl Lifecycle for SchedulerEngine {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn start(&self) -> Result<()> {
        self.start_loop().await
    }

    async fn stop(&self) -> Result<()> {
        let Some((token, handle)) = self.loop_handle.lock().await.take() else {
            return Ok(());
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Scheduler loop exited abnormally: {e}");
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("⏹️ Scheduler stopped");
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

impl SchedulerEngine {
    async fn start_loop(&self) -> Result<()> {
        let mut slot = self.loop_handle.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        // Nothing before start is caught up
        *self.core.last_scan.lock() = Some(Utc::now().trunc_subsecs(0));
        let token = CancellationToken::new();
        let handle = tokio::spawn(scan_loop(self.core.clone(), token.clone()));
        *slot = Some((token, handle));
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("⏰ Scheduler started (poll {}ms)", self.core.config.poll_interval_ms);
        Ok(())
    }
}

async fn scan_loop(core: Arc<ScanCore>, token: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                core.scan_at(Utc::now()).await;
            }
        }
    }
}
