//! Dispatch Engine: a fixed worker pool that claims scheduled runs and
//! performs their HTTP call.
//!
//! ```text
//! enqueue ──▶ bounded queue ──▶ worker × N
//!                                 ├─ reserve slot (cap check) + cancel token
//!                                 ├─ claim SCHEDULED → RUNNING
//!                                 ├─ HTTP call under deadline / cancel token
//!                                 └─ SUCCESS | FAILED | TIMEOUT | CANCELED | CALLBACK_PENDING
//! ```
//!
//! Outbound concurrency equals the pool size. A run can only be interrupted
//! through its cancel token.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cronclaw_core::config::CronClawConfig;
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::lifecycle::{Health, Lifecycle};
use cronclaw_core::types::{ConcurrencyPolicy, ExecType, Run, RunStatus};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::http::{self, CallFailure, OutboundRequest};
use crate::progress::ProgressTracker;
use crate::run_service::RunService;
use crate::task_cache::TaskCache;

/// What the scan engine and control surface need from a dispatcher.
pub trait Dispatcher: Send + Sync {
    /// Queue a SCHEDULED run. `bypass_cap` skips the per-task concurrency check.
    fn enqueue(&self, run: Run, bypass_cap: bool) -> Result<()>;

    /// Runs of this task currently holding a worker slot.
    fn active_count(&self, task_id: i64) -> usize;

    /// Cancel an in-flight run. False when this dispatcher does not hold it.
    fn cancel_run(&self, run_id: i64) -> bool;
}

#[derive(Debug)]
struct QueuedRun {
    run: Run,
    bypass_cap: bool,
}

/// Cancel handles and per-task active counts, guarded together.
#[derive(Default)]
struct ActiveState {
    cancels: HashMap<i64, (i64, CancellationToken)>,
    active: HashMap<i64, usize>,
}

/// Releases a reserved slot when dropped.
struct SlotGuard<'a> {
    state: &'a Mutex<ActiveState>,
    run_id: i64,
    task_id: i64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.cancels.remove(&self.run_id);
        if let Some(n) = state.active.get_mut(&self.task_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.active.remove(&self.task_id);
            }
        }
    }
}

struct Shared {
    config: Arc<CronClawConfig>,
    client: reqwest::Client,
    runs: Arc<RunService>,
    tasks: Arc<TaskCache>,
    progress: Arc<ProgressTracker>,
    state: Mutex<ActiveState>,
}

/// Sender, shutdown token and worker handles of one started pool.
struct Pool {
    sender: mpsc::Sender<QueuedRun>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

pub struct Executor {
    shared: Arc<Shared>,
    pool: Mutex<Option<Pool>>,
    running: AtomicBool,
}

impl Executor {
    pub fn new(
        config: Arc<CronClawConfig>,
        runs: Arc<RunService>,
        tasks: Arc<TaskCache>,
        progress: Arc<ProgressTracker>,
    ) -> Result<Self> {
        if config.executor.worker_pool_size == 0 {
            return Err(CronClawError::Config("worker pool size must be greater than 0".into()));
        }
        if config.executor.queue_capacity == 0 {
            return Err(CronClawError::Config("queue capacity must be greater than 0".into()));
        }
        let client = reqwest::Client::builder()
            .user_agent(config.executor.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.executor.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| CronClawError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                runs,
                tasks,
                progress,
                state: Mutex::new(ActiveState::default()),
            }),
            pool: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Run ids currently holding a worker slot.
    pub fn in_flight(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.shared.state.lock().cancels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Dispatcher for Executor {
    fn enqueue(&self, run: Run, bypass_cap: bool) -> Result<()> {
        let pool = self.pool.lock();
        let Some(pool) = pool.as_ref() else {
            return Err(CronClawError::ExecutorStopped);
        };
        let run_id = run.id;
        pool.sender
            .try_send(QueuedRun { run, bypass_cap })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CronClawError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => CronClawError::ExecutorStopped,
            })?;
        tracing::debug!(run_id, "📥 Run enqueued");
        Ok(())
    }

    fn active_count(&self, task_id: i64) -> usize {
        self.shared.state.lock().active.get(&task_id).copied().unwrap_or(0)
    }

    fn cancel_run(&self, run_id: i64) -> bool {
        let state = self.shared.state.lock();
        match state.cancels.get(&run_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(run_id, "🛑 Cancel requested");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Lifecycle for Executor {
    fn name(&self) -> &'static str {
        "executor"
    }

    async fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return Ok(());
        }
        let size = self.shared.config.executor.worker_pool_size;
        let (sender, receiver) = mpsc::channel(self.shared.config.executor.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        // Workers get their own token so they outlive the caller of start()
        let shutdown = CancellationToken::new();
        let workers = (0..size)
            .map(|i| {
                let shared = self.shared.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker_loop(i, shared, receiver, shutdown).await })
            })
            .collect();
        *pool = Some(Pool { sender, shutdown, workers });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("⚙️ Executor started with {size} worker(s)");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(pool) = self.pool.lock().take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        let aborted = {
            let state = self.shared.state.lock();
            for (_, token) in state.cancels.values() {
                token.cancel();
            }
            state.cancels.len()
        };
        drop(pool.sender);
        pool.shutdown.cancel();
        for result in futures::future::join_all(pool.workers).await {
            if let Err(e) = result {
                tracing::error!("Worker exited abnormally: {e}");
            }
        }
        tracing::info!("⚙️ Executor stopped ({aborted} in-flight run(s) canceled)");
        Ok(())
    }

    fn health(&self) -> Health {
        if self.is_running() {
            Health::Healthy
        } else {
            Health::Inactive
        }
    }
}

async fn worker_loop(
    index: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedRun>>>,
    shutdown: CancellationToken,
) {
    tracing::debug!("Worker {index} started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = async { receiver.lock().await.recv().await } => next,
        };
        let Some(item) = next else { break };
        let span = tracing::info_span!(
            "dispatch",
            run_id = item.run.id,
            task_id = item.run.task_id,
            trace_id = %item.run.trace_id
        );
        shared.process(item, &shutdown).instrument(span).await;
    }
    tracing::debug!("Worker {index} exited");
}

impl Shared {
    async fn process(&self, item: QueuedRun, shutdown: &CancellationToken) {
        let run = item.run;

        // Concurrency cap only applies to SKIP-policy tasks that were not bypassed
        let cap = if item.bypass_cap {
            None
        } else {
            match self.tasks.get(run.task_id).await {
                Ok(Some(task)) if task.concurrency_policy == ConcurrencyPolicy::Skip => {
                    Some(task.max_concurrency.max(1) as usize)
                }
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Task lookup failed, dispatching without cap: {e}");
                    None
                }
            }
        };

        let Some((_guard, token)) = self.reserve(&run, cap, shutdown) else {
            if let Err(e) = self
                .runs
                .mark_skipped(run.id, RunStatus::ConcurrentSkip, "concurrency limit reached")
                .await
            {
                tracing::error!("Failed to mark run skipped: {e}");
            }
            return;
        };

        match self.runs.transition_to_running(run.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Run already claimed or closed, skipping");
                return;
            }
            Err(e) => {
                tracing::error!("Claim failed: {e}");
                return;
            }
        }

        self.execute(&run, &token).await;
    }

    /// Register the cancel token and take an active slot, unless the cap is full.
    fn reserve<'a>(
        &'a self,
        run: &Run,
        cap: Option<usize>,
        shutdown: &CancellationToken,
    ) -> Option<(SlotGuard<'a>, CancellationToken)> {
        let mut state = self.state.lock();
        let active = state.active.get(&run.task_id).copied().unwrap_or(0);
        if let Some(max) = cap
            && active >= max
        {
            tracing::info!("⏭️ Concurrency limit {active}/{max} reached");
            return None;
        }
        let token = shutdown.child_token();
        state.cancels.insert(run.id, (run.task_id, token.clone()));
        *state.active.entry(run.task_id).or_insert(0) += 1;
        Some((
            SlotGuard {
                state: &self.state,
                run_id: run.id,
                task_id: run.task_id,
            },
            token,
        ))
    }

    async fn execute(&self, run: &Run, token: &CancellationToken) {
        let snap = &run.snapshot;
        let timeout_secs = if snap.timeout_secs > 0 {
            snap.timeout_secs as u64
        } else {
            self.config.executor.default_timeout_secs
        };

        let Some(base_url) = self.config.resolve_service(&snap.target_service) else {
            let msg = format!("unknown target service '{}'", snap.target_service);
            tracing::warn!("❌ {msg}");
            self.finish_failed(run.id, None, &msg).await;
            return;
        };
        let request = match OutboundRequest::build(run, &base_url) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("❌ {e}");
                self.finish_failed(run.id, None, &e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self.runs.record_request(run.id, &request.snapshot()).await {
            tracing::warn!("Failed to record request snapshot: {e}");
        }

        tracing::info!("🚀 {} {} (timeout {timeout_secs}s)", request.method, request.url);
        let call = async {
            let resp = request.into_request(&self.client).send().await?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Ok::<_, reqwest::Error>((status, body))
        };
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            res = tokio::time::timeout(Duration::from_secs(timeout_secs), call) => Some(res),
        };

        let now = Utc::now();
        match outcome {
            None => {
                tracing::info!("🛑 Run canceled");
                self.log_err(self.runs.mark_canceled(run.id, "canceled").await);
            }
            Some(Err(_)) => {
                tracing::warn!("⏰ Run timed out after {timeout_secs}s");
                self.log_err(self.runs.mark_timeout(run.id, "request_timeout").await);
            }
            Some(Ok(Err(e))) => match http::classify_error(&e) {
                CallFailure::Timeout => {
                    tracing::warn!("⏰ Run timed out: {e}");
                    self.log_err(self.runs.mark_timeout(run.id, "request_timeout").await);
                }
                CallFailure::Failed(msg) => {
                    tracing::warn!("❌ Request failed ({msg}): {e}");
                    self.finish_failed(run.id, None, &msg).await;
                }
            },
            Some(Ok(Ok((status, body)))) => {
                let body = http::truncate_body(body);
                let code = status.as_u16() as i32;
                if !status.is_success() {
                    let msg = http::status_message(status, &body);
                    tracing::warn!("❌ Target answered {status}");
                    self.finish_failed(run.id, Some((code, &body)), &msg).await;
                } else if snap.exec_type == ExecType::Async {
                    let secs = if snap.callback_timeout_secs > 0 {
                        snap.callback_timeout_secs
                    } else {
                        self.config.executor.default_callback_timeout_secs as i64
                    };
                    let deadline = now + chrono::Duration::seconds(secs);
                    tracing::info!("⏳ Accepted ({status}), awaiting callback until {deadline}");
                    self.log_err(self.runs.mark_callback_pending(run.id, code, &body, deadline).await);
                } else {
                    tracing::info!("✅ Run succeeded ({status})");
                    self.log_err(self.runs.mark_success(run.id, code, &body).await);
                    self.progress.clear(run.id);
                }
            }
        }
    }

    async fn finish_failed(&self, run_id: i64, response: Option<(i32, &str)>, message: &str) {
        self.log_err(self.runs.mark_failed(run_id, response, message).await);
        self.progress.clear(run_id);
    }

    fn log_err<T>(&self, result: Result<T>) {
        if let Err(e) = result {
            tracing::error!("Failed to record run outcome: {e}");
        }
    }
}
