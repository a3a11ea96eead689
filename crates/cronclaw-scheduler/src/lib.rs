//! # CronClaw Scheduler
//!
//! Single-instance cron scheduler that fires HTTP calls at configured
//! services and tracks every firing as a durable run.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval, window (last_scan, now])
//!   ├── cron match per second, in the task's timezone
//!   ├── dedupe → overlap → failure chain → concurrency cap
//!   └── create SCHEDULED run → Executor queue
//!
//! Executor (N workers)
//!   ├── reserve slot + claim SCHEDULED → RUNNING
//!   ├── HTTP call (timeout, per-run cancel)
//!   └── SUCCESS | FAILED | TIMEOUT | CANCELED | CALLBACK_PENDING
//!
//! RunScanner (tokio interval)
//!   ├── CALLBACK_PENDING past deadline → FAILED_TIMEOUT
//!   ├── RUNNING sync past threshold → TIMEOUT
//!   └── progress of finished runs → cleared
//!
//! ControlPlane: trigger · cancel · progress · callback finalize
//! ```
//!
//! Only one engine may scan a given store; there is no cross-process lock.

pub mod cleanup;
pub mod control;
pub mod cron;
pub mod engine;
pub mod executor;
pub mod http;
pub mod progress;
pub mod run_service;
pub mod runtime;
pub mod scanner;
pub mod task_cache;

pub use cleanup::{CleanupReport, RunCleanup};
pub use control::{CallbackOutcome, ControlPlane};
pub use cron::{CronSchedule, should_fire};
pub use engine::{FireDecision, ScanReport, SchedulerEngine};
pub use executor::{Dispatcher, Executor};
pub use progress::{Progress, ProgressTracker};
pub use run_service::RunService;
pub use runtime::SchedulerRuntime;
pub use scanner::{RunScanner, SweepReport};
pub use task_cache::TaskCache;
