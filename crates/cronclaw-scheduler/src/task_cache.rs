//! Task Cache: read-through/write-through cache of ENABLED tasks.
//!
//! Cached values are `Arc<Task>` snapshots: callers share them read-only and
//! every write replaces the entry with a freshly loaded copy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::lifecycle::{Health, Lifecycle};
use cronclaw_core::traits::TaskStore;
use cronclaw_core::types::{Task, TaskFilter, TaskStatus};
use parking_lot::RwLock;

use crate::cron::CronSchedule;

pub struct TaskCache {
    store: Arc<dyn TaskStore>,
    enabled: RwLock<HashMap<i64, Arc<Task>>>,
    started: AtomicBool,
}

impl TaskCache {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            enabled: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Reload every enabled task from the store.
    pub async fn refresh(&self) -> Result<usize> {
        let tasks = self.store.list_enabled().await?;
        let map: HashMap<i64, Arc<Task>> =
            tasks.into_iter().map(|t| (t.id, Arc::new(t))).collect();
        let count = map.len();
        *self.enabled.write() = map;
        tracing::debug!("🔄 Task cache refreshed: {count} enabled");
        Ok(count)
    }

    /// Cached copy if enabled, otherwise whatever the store has.
    pub async fn get(&self, id: i64) -> Result<Option<Arc<Task>>> {
        let cached = self.enabled.read().get(&id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        Ok(self.store.get(id).await?.map(Arc::new))
    }

    /// Enabled tasks ordered by id.
    pub fn list_enabled(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self.enabled.read().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub async fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<(Vec<Task>, u64)> {
        let tasks = self.store.list_filtered(filter, limit, offset).await?;
        let total = self.store.count_filtered(filter).await?;
        Ok((tasks, total))
    }

    pub async fn create(&self, mut task: Task) -> Result<Arc<Task>> {
        task.normalize()?;
        CronSchedule::parse(&task.cron_expr)?;
        let id = self.store.create(&task).await?;
        let task = self.reload(id).await?;
        tracing::info!("📅 Task created: '{}' ({}) [{}]", task.name, task.id, task.status);
        Ok(task)
    }

    /// Optimistic-lock update of everything but status.
    pub async fn update_meta(&self, mut task: Task) -> Result<Arc<Task>> {
        task.normalize()?;
        CronSchedule::parse(&task.cron_expr)?;
        self.store.update_meta(&task).await?;
        let task = self.reload(task.id).await?;
        tracing::info!("✏️ Task updated: '{}' ({}) v{}", task.name, task.id, task.version);
        Ok(task)
    }

    pub async fn update_status(&self, id: i64, status: TaskStatus) -> Result<Arc<Task>> {
        self.store.update_status(id, status).await?;
        let task = self.reload(id).await?;
        match status {
            TaskStatus::Enabled => tracing::info!("▶️ Task enabled: '{}' ({})", task.name, id),
            TaskStatus::Disabled => tracing::info!("⏸️ Task disabled: '{}' ({})", task.name, id),
        }
        Ok(task)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.store.soft_delete(id).await?;
        self.enabled.write().remove(&id);
        tracing::info!("🗑️ Task deleted: {id}");
        Ok(())
    }

    /// Fetch the persisted row and place or evict it according to its status.
    async fn reload(&self, id: i64) -> Result<Arc<Task>> {
        let task = self
            .store
            .get(id)
            .await?
            .map(Arc::new)
            .ok_or(CronClawError::TaskNotFound(id))?;
        let mut enabled = self.enabled.write();
        if task.is_enabled() {
            enabled.insert(id, task.clone());
        } else {
            enabled.remove(&id);
        }
        Ok(task)
    }

    pub fn len(&self) -> usize {
        self.enabled.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Lifecycle for TaskCache {
    fn name(&self) -> &'static str {
        "task_cache"
    }

    async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let count = self.refresh().await?;
        self.started.store(true, Ordering::SeqCst);
        tracing::info!("📋 Task cache loaded {count} enabled task(s)");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.enabled.write().clear();
        Ok(())
    }

    fn health(&self) -> Health {
        if self.started.load(Ordering::SeqCst) {
            Health::Healthy
        } else {
            Health::Inactive
        }
    }
}
