//! Runtime wiring: builds every component once and owns their start/stop order.
//!
//! ```text
//! TaskCache → RunService → ProgressTracker → Executor → SchedulerEngine → RunScanner → RunCleanup
//!                                                 └──────────── ControlPlane ───────────┘
//! ```

use std::sync::Arc;

use cronclaw_core::config::CronClawConfig;
use cronclaw_core::error::Result;
use cronclaw_core::lifecycle::{Health, Lifecycle};
use cronclaw_core::traits::{RunStore, TaskStore};

use crate::cleanup::RunCleanup;
use crate::control::ControlPlane;
use crate::engine::SchedulerEngine;
use crate::executor::Executor;
use crate::progress::ProgressTracker;
use crate::run_service::RunService;
use crate::scanner::RunScanner;
use crate::task_cache::TaskCache;

pub struct SchedulerRuntime {
    tasks: Arc<TaskCache>,
    runs: Arc<RunService>,
    progress: Arc<ProgressTracker>,
    executor: Arc<Executor>,
    engine: Arc<SchedulerEngine>,
    scanner: Arc<RunScanner>,
    cleanup: Arc<RunCleanup>,
    control: ControlPlane,
}

impl SchedulerRuntime {
    pub fn new(
        config: CronClawConfig,
        task_store: Arc<dyn TaskStore>,
        run_store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let tasks = Arc::new(TaskCache::new(task_store));
        let runs = Arc::new(RunService::new(run_store));
        let progress = Arc::new(ProgressTracker::new());
        let executor = Arc::new(Executor::new(
            config.clone(),
            runs.clone(),
            tasks.clone(),
            progress.clone(),
        )?);
        let engine = Arc::new(SchedulerEngine::new(
            config.scheduler.clone(),
            tasks.clone(),
            runs.clone(),
            executor.clone(),
        ));
        let scanner = Arc::new(RunScanner::new(
            config.scanner.clone(),
            runs.clone(),
            progress.clone(),
        ));
        let cleanup = Arc::new(RunCleanup::new(config.cleanup.clone(), runs.clone()));
        let control = ControlPlane::new(tasks.clone(), runs.clone(), progress.clone(), executor.clone());

        Ok(Self {
            tasks,
            runs,
            progress,
            executor,
            engine,
            scanner,
            cleanup,
            control,
        })
    }

    /// Components in start order.
    fn components(&self) -> [Arc<dyn Lifecycle>; 5] {
        [
            self.tasks.clone(),
            self.executor.clone(),
            self.engine.clone(),
            self.scanner.clone(),
            self.cleanup.clone(),
        ]
    }

    /// Start everything in dependency order. If one component fails, the ones
    /// already started are stopped again before the error is returned.
    pub async fn start(&self) -> Result<()> {
        let components = self.components();
        for (i, component) in components.iter().enumerate() {
            if let Err(e) = component.start().await {
                tracing::error!("❌ Failed to start {}: {e}", component.name());
                for started in components[..i].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        tracing::warn!("Failed to stop {}: {stop_err}", started.name());
                    }
                }
                return Err(e);
            }
        }
        tracing::info!("🚀 CronClaw runtime started");
        Ok(())
    }

    /// Stop in reverse start order. Every component is stopped even if an
    /// earlier one fails; the first error is returned.
    pub async fn stop(&self) -> Result<()> {
        let mut first_err = None;
        for component in self.components().iter().rev() {
            if let Err(e) = component.stop().await {
                tracing::error!("❌ Failed to stop {}: {e}", component.name());
                first_err.get_or_insert(e);
            }
        }
        tracing::info!("👋 CronClaw runtime stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Health of every component by name.
    pub fn health(&self) -> Vec<(&'static str, Health)> {
        self.components()
            .iter()
            .map(|c| (c.name(), c.health()))
            .collect()
    }

    pub fn tasks(&self) -> &Arc<TaskCache> {
        &self.tasks
    }

    pub fn runs(&self) -> &Arc<RunService> {
        &self.runs
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    pub fn scanner(&self) -> &Arc<RunScanner> {
        &self.scanner
    }

    pub fn cleanup(&self) -> &Arc<RunCleanup> {
        &self.cleanup
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronclaw_core::error::CronClawError;
    use cronclaw_db::SqliteStore;

    fn runtime(config: CronClawConfig) -> Result<SchedulerRuntime> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        SchedulerRuntime::new(config, store.clone(), store)
    }

    #[test]
    fn test_zero_pool_is_fatal() {
        let mut config = CronClawConfig::default();
        config.executor.worker_pool_size = 0;
        assert!(matches!(runtime(config), Err(CronClawError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_stop_health() {
        let rt = runtime(CronClawConfig::default()).unwrap();
        assert!(rt.health().iter().all(|(_, h)| *h == Health::Inactive));

        rt.start().await.unwrap();
        let health = rt.health();
        let names: Vec<&str> = health.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["task_cache", "executor", "scheduler", "scanner", "cleanup"]);
        // Cleanup is disabled by default
        assert!(health[..4].iter().all(|(_, h)| h.is_healthy()));
        assert_eq!(health[4].1, Health::Inactive);

        rt.stop().await.unwrap();
        assert!(rt.health().iter().all(|(_, h)| *h == Health::Inactive));
    }
}
