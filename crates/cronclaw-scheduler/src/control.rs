//! Control surface for an API layer to call into. Covers manual trigger,
//! cancel, progress reporting and async callback finalize.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::types::{ConcurrencyPolicy, NewRun, Run, RunStatus};
use serde::{Deserialize, Serialize};

use crate::executor::Dispatcher;
use crate::progress::{Progress, ProgressTracker};
use crate::run_service::RunService;
use crate::task_cache::TaskCache;

/// Result reported by the target service for an async run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Success {
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        body: String,
    },
    Failed {
        #[serde(default)]
        message: String,
    },
    FailedTimeout {
        #[serde(default)]
        message: String,
    },
}

pub struct ControlPlane {
    tasks: Arc<TaskCache>,
    runs: Arc<RunService>,
    progress: Arc<ProgressTracker>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl ControlPlane {
    pub fn new(
        tasks: Arc<TaskCache>,
        runs: Arc<RunService>,
        progress: Arc<ProgressTracker>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            tasks,
            runs,
            progress,
            dispatcher,
        }
    }

    /// Create and enqueue a run at the current second, outside the schedule.
    pub async fn trigger(&self, task_id: i64) -> Result<Run> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or(CronClawError::TaskNotFound(task_id))?;

        if task.concurrency_policy == ConcurrencyPolicy::Skip {
            let active = self.dispatcher.active_count(task_id);
            let max = task.max_concurrency.max(1);
            if active >= max as usize {
                return Err(CronClawError::ConcurrencyLimit { task_id, active, max });
            }
        }

        let new = NewRun::for_task(&task, Utc::now().trunc_subsecs(0), 1)?;
        let run = self.runs.create_scheduled(&new).await?;
        if let Err(e) = self.dispatcher.enqueue(run.clone(), false) {
            self.runs.mark_canceled(run.id, &format!("enqueue_failed: {e}")).await?;
            return Err(e);
        }
        tracing::info!(task_id, run_id = run.id, "👆 Task '{}' triggered manually", task.name);
        Ok(run)
    }

    /// Cancel a non-terminal run. Returns `true` when it was interrupted in
    /// flight; the worker then records CANCELED.
    pub async fn cancel(&self, run_id: i64) -> Result<bool> {
        let run = self.runs.require(run_id).await?;
        if run.status.is_terminal() {
            return Err(invalid_state(&run));
        }
        if self.dispatcher.cancel_run(run_id) {
            tracing::info!(run_id, "🛑 Cancel requested for in-flight run");
            return Ok(true);
        }
        if !self.runs.mark_canceled(run_id, "canceled").await? {
            // Finished between the read and the mark
            return Err(invalid_state(&self.runs.require(run_id).await?));
        }
        self.progress.clear(run_id);
        tracing::info!(run_id, "🛑 Run canceled");
        Ok(false)
    }

    /// Record progress for a run that is still pending or in flight.
    pub async fn update_progress(
        &self,
        run_id: i64,
        current: i64,
        total: i64,
        message: &str,
    ) -> Result<Progress> {
        if current < 0 || total < 0 {
            return Err(CronClawError::InvalidArgument(
                "progress values must not be negative".into(),
            ));
        }
        if current > 0 && total == 0 {
            return Err(CronClawError::InvalidArgument("current_requires_total".into()));
        }
        let run = self.runs.require(run_id).await?;
        if run.status.is_terminal() {
            return Err(invalid_state(&run));
        }
        Ok(self.progress.set(run_id, current as u64, total as u64, message))
    }

    pub fn progress(&self, run_id: i64) -> Option<Progress> {
        self.progress.get(run_id)
    }

    /// Close a CALLBACK_PENDING run with the outcome the target reported.
    pub async fn finalize_callback(&self, run_id: i64, outcome: CallbackOutcome) -> Result<Run> {
        let run = self.runs.require(run_id).await?;
        if run.status != RunStatus::CallbackPending {
            return Err(invalid_state(&run));
        }
        let moved = match &outcome {
            CallbackOutcome::Success { code, body } => {
                self.runs
                    .mark_callback_success(run_id, code.unwrap_or(200), body)
                    .await?
            }
            CallbackOutcome::Failed { message } => {
                self.runs.mark_callback_failed(run_id, message).await?
            }
            CallbackOutcome::FailedTimeout { message } => {
                self.runs.mark_failed_timeout(run_id, message).await?
            }
        };
        let run = self.runs.require(run_id).await?;
        if !moved {
            return Err(invalid_state(&run));
        }
        self.progress.clear(run_id);
        tracing::info!(run_id, task_id = run.task_id, "📨 Callback finalized: {}", run.status);
        Ok(run)
    }
}

fn invalid_state(run: &Run) -> CronClawError {
    CronClawError::InvalidState {
        run_id: run.id,
        status: run.status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::Duration;
    use cronclaw_core::types::{ExecType, Task, TaskStatus};
    use cronclaw_db::SqliteStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubDispatcher {
        enqueued: Mutex<Vec<i64>>,
        in_flight: Mutex<HashSet<i64>>,
        active: AtomicUsize,
        reject: AtomicBool,
    }

    impl Dispatcher for StubDispatcher {
        fn enqueue(&self, run: Run, _bypass_cap: bool) -> Result<()> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(CronClawError::ExecutorStopped);
            }
            self.enqueued.lock().push(run.id);
            Ok(())
        }

        fn active_count(&self, _task_id: i64) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn cancel_run(&self, run_id: i64) -> bool {
            self.in_flight.lock().remove(&run_id)
        }
    }

    struct Fixture {
        control: ControlPlane,
        tasks: Arc<TaskCache>,
        runs: Arc<RunService>,
        dispatcher: Arc<StubDispatcher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tasks = Arc::new(TaskCache::new(store.clone()));
        let runs = Arc::new(RunService::new(store));
        let progress = Arc::new(ProgressTracker::new());
        let dispatcher = Arc::new(StubDispatcher::default());
        Fixture {
            control: ControlPlane::new(tasks.clone(), runs.clone(), progress, dispatcher.clone()),
            tasks,
            runs,
            dispatcher,
        }
    }

    async fn task(f: &Fixture, configure: impl FnOnce(&mut Task)) -> Arc<Task> {
        let mut t = Task::new("job", "0 0 0 1 1 *", "svc", "/hook");
        t.status = TaskStatus::Enabled;
        configure(&mut t);
        f.tasks.create(t).await.unwrap()
    }

    async fn pending_callback(f: &Fixture) -> Run {
        let t = task(f, |t| t.exec_type = ExecType::Async).await;
        let run = f.control.trigger(t.id).await.unwrap();
        f.runs.transition_to_running(run.id).await.unwrap();
        f.runs
            .mark_callback_pending(run.id, 202, "accepted", Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn test_trigger_enqueues() {
        let f = fixture();
        let t = task(&f, |_| {}).await;
        let run = f.control.trigger(t.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(run.attempt, 1);
        assert_eq!(*f.dispatcher.enqueued.lock(), vec![run.id]);
        assert!(f.control.trigger(404).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_trigger_respects_skip_cap() {
        let f = fixture();
        let t = task(&f, |t| t.concurrency_policy = ConcurrencyPolicy::Skip).await;
        f.dispatcher.active.store(1, Ordering::SeqCst);
        let err = f.control.trigger(t.id).await.unwrap_err();
        assert!(matches!(err, CronClawError::ConcurrencyLimit { active: 1, max: 1, .. }));

        let parallel = task(&f, |t| t.concurrency_policy = ConcurrencyPolicy::Parallel).await;
        assert!(f.control.trigger(parallel.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_enqueue_failure_cancels() {
        let f = fixture();
        let t = task(&f, |_| {}).await;
        f.dispatcher.reject.store(true, Ordering::SeqCst);
        let err = f.control.trigger(t.id).await.unwrap_err();
        assert!(matches!(err, CronClawError::ExecutorStopped));
        let runs = f.runs.list_by_task(t.id, &Default::default(), 10, 0).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_and_stored() {
        let f = fixture();
        let t = task(&f, |_| {}).await;
        let run = f.control.trigger(t.id).await.unwrap();

        f.dispatcher.in_flight.lock().insert(run.id);
        assert!(f.control.cancel(run.id).await.unwrap());
        // Still SCHEDULED until the worker records the cancel
        assert_eq!(f.runs.require(run.id).await.unwrap().status, RunStatus::Scheduled);

        assert!(!f.control.cancel(run.id).await.unwrap());
        assert_eq!(f.runs.require(run.id).await.unwrap().status, RunStatus::Canceled);

        let err = f.control.cancel(run.id).await.unwrap_err();
        assert!(matches!(err, CronClawError::InvalidState { .. }));
        assert!(f.control.cancel(777).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_progress_validation() {
        let f = fixture();
        let t = task(&f, |_| {}).await;
        let run = f.control.trigger(t.id).await.unwrap();

        let err = f.control.update_progress(run.id, -1, 10, "").await.unwrap_err();
        assert!(matches!(err, CronClawError::InvalidArgument(_)));
        let err = f.control.update_progress(run.id, 3, 0, "").await.unwrap_err();
        assert!(matches!(err, CronClawError::InvalidArgument(m) if m == "current_requires_total"));

        let p = f.control.update_progress(run.id, 1, 4, "a quarter").await.unwrap();
        assert_eq!(p.percent, 25.0);
        assert_eq!(f.control.progress(run.id).unwrap().message, "a quarter");
        // Unknown total with no progress yet is accepted
        assert!(f.control.update_progress(run.id, 0, 0, "starting").await.is_ok());

        f.control.cancel(run.id).await.unwrap();
        let err = f.control.update_progress(run.id, 2, 4, "").await.unwrap_err();
        assert!(matches!(err, CronClawError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_finalize_success_defaults_code() {
        let f = fixture();
        let run = pending_callback(&f).await;
        f.control.update_progress(run.id, 5, 10, "half").await.unwrap();

        let outcome: CallbackOutcome = serde_json::from_str(r#"{"outcome":"success","body":"done"}"#).unwrap();
        let done = f.control.finalize_callback(run.id, outcome).await.unwrap();
        assert_eq!(done.status, RunStatus::Success);
        assert_eq!(done.response_code, Some(200));
        assert_eq!(done.response_body.as_deref(), Some("done"));
        assert!(done.end_time.is_some());
        assert!(f.control.progress(run.id).is_none());

        // Second finalize is refused
        let again = f
            .control
            .finalize_callback(run.id, CallbackOutcome::Failed { message: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(again, CronClawError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_finalize_failures() {
        let f = fixture();
        let failed = pending_callback(&f).await;
        let run = f
            .control
            .finalize_callback(failed.id, CallbackOutcome::Failed { message: "bad input".into() })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::CallbackFailed);
        assert_eq!(run.error_message.as_deref(), Some("bad input"));

        let f = fixture();
        let timed_out = pending_callback(&f).await;
        let run = f
            .control
            .finalize_callback(timed_out.id, CallbackOutcome::FailedTimeout { message: "gave up".into() })
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::FailedTimeout);
    }

    #[tokio::test]
    async fn test_finalize_requires_callback_pending() {
        let f = fixture();
        let t = task(&f, |_| {}).await;
        let run = f.control.trigger(t.id).await.unwrap();
        let err = f
            .control
            .finalize_callback(run.id, CallbackOutcome::Success { code: None, body: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, CronClawError::InvalidState { status, .. } if status == "SCHEDULED"));
    }
}
