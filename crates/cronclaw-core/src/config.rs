//! CronClaw configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CronClawError, Result};

/// Upper bound for `scheduler.max_window_factor`.
pub const MAX_WINDOW_FACTOR: u32 = 3600;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronClawConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Target services by name. A task's `target_service` is looked up here.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

impl CronClawConfig {
    /// Load config from the default path (~/.cronclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CronClawError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CronClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CronClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Reject values the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.worker_pool_size == 0 {
            return Err(CronClawError::Config(
                "executor.worker_pool_size must be greater than 0".into(),
            ));
        }
        if self.executor.queue_capacity == 0 {
            return Err(CronClawError::Config(
                "executor.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(CronClawError::Config(
                "scheduler.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.scheduler.max_window_factor == 0
            || self.scheduler.max_window_factor > MAX_WINDOW_FACTOR
        {
            return Err(CronClawError::Config(format!(
                "scheduler.max_window_factor must be between 1 and {MAX_WINDOW_FACTOR}"
            )));
        }
        for (name, svc) in &self.services {
            if !svc.base_url.starts_with("http://") && !svc.base_url.starts_with("https://") {
                return Err(CronClawError::Config(format!(
                    "services.{name}.base_url must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a task's target service to a base URL.
    /// Absolute URLs are used as-is.
    pub fn resolve_service(&self, service: &str) -> Option<String> {
        if service.starts_with("http://") || service.starts_with("https://") {
            return Some(service.trim_end_matches('/').to_string());
        }
        self.services
            .get(service)
            .map(|s| s.base_url.trim_end_matches('/').to_string())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CronClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cronclaw")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

fn default_db_path() -> String {
    "~/.cronclaw/cronclaw.db".into()
}

/// Scan engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// The catch-up window never spans more than this many poll intervals.
    #[serde(default = "default_max_window_factor")]
    pub max_window_factor: u32,
    /// Max due instants evaluated per task per tick (0 = unbounded).
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// How many recent runs are inspected for overlap and failure decisions.
    #[serde(default = "default_recent_runs_window")]
    pub recent_runs_window: usize,
    /// Reload enabled tasks from the store this often, so edits made by
    /// other processes are picked up (0 = never).
    #[serde(default = "default_task_refresh_secs")]
    pub task_refresh_secs: u64,
    /// How long CANCEL_PREV waits for canceled runs to give back their slots.
    #[serde(default = "default_cancel_release_ms")]
    pub cancel_release_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_window_factor: default_max_window_factor(),
            batch_limit: default_batch_limit(),
            recent_runs_window: default_recent_runs_window(),
            task_refresh_secs: default_task_refresh_secs(),
            cancel_release_ms: default_cancel_release_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_window_factor() -> u32 { 10 }
fn default_batch_limit() -> usize { 200 }
fn default_recent_runs_window() -> usize { 50 }
fn default_task_refresh_secs() -> u64 { 5 }
fn default_cancel_release_ms() -> u64 { 2000 }

/// Dispatch engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Used when a task's timeout is not positive.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Used when a task's callback timeout is not positive.
    #[serde(default = "default_callback_timeout_secs")]
    pub default_callback_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            queue_capacity: default_queue_capacity(),
            default_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            default_callback_timeout_secs: default_callback_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_worker_pool_size() -> usize { 8 }
fn default_queue_capacity() -> usize { 1024 }
fn default_timeout_secs() -> u64 { 10 }
fn default_connect_timeout_secs() -> u64 { 5 }
fn default_callback_timeout_secs() -> u64 { 300 }
fn default_user_agent() -> String { format!("CronClaw/{}", env!("CARGO_PKG_VERSION")) }

/// Reconciliation scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_scan_batch_limit")]
    pub batch_limit: usize,
    /// RUNNING sync runs older than this are marked TIMEOUT (0 = disabled).
    #[serde(default)]
    pub sync_run_stuck_timeout_secs: u64,
    /// Progress of a terminal run is kept this long after its end time.
    #[serde(default)]
    pub progress_cleanup_grace_secs: u64,
    /// Progress entries not updated for this long are dropped regardless of run state.
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            batch_limit: default_scan_batch_limit(),
            sync_run_stuck_timeout_secs: 0,
            progress_cleanup_grace_secs: 0,
            progress_ttl_secs: default_progress_ttl_secs(),
        }
    }
}

fn default_scan_interval_secs() -> u64 { 30 }
fn default_scan_batch_limit() -> usize { 500 }
fn default_progress_ttl_secs() -> u64 { 600 }

/// Periodic run retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    /// Delete runs scheduled before now minus this age (0 = keep all).
    #[serde(default = "default_cleanup_max_age_secs")]
    pub max_age_secs: u64,
    /// Keep at most this many runs per task (0 = unlimited).
    #[serde(default)]
    pub max_per_task: u32,
    /// Rows deleted per statement.
    #[serde(default = "default_cleanup_chunk_size")]
    pub chunk_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_cleanup_interval_secs(),
            max_age_secs: default_cleanup_max_age_secs(),
            max_per_task: 0,
            chunk_size: default_cleanup_chunk_size(),
        }
    }
}

fn default_cleanup_interval_secs() -> u64 { 3600 }
fn default_cleanup_max_age_secs() -> u64 { 7 * 24 * 3600 }
fn default_cleanup_chunk_size() -> usize { 500 }

/// One named outbound target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
}
