//! # CronClaw
//!
//! Cron-driven HTTP task scheduler with durable run tracking.
//!
//! Usage:
//!   cronclaw serve                         # Run the scheduler until Ctrl-C
//!   cronclaw init                          # Write ~/.cronclaw/config.toml
//!   cronclaw task add job.toml             # Register a task from a TOML file
//!   cronclaw task list --status ENABLED    # List tasks
//!   cronclaw runs list --task 3            # Recent runs of a task
//!   cronclaw runs cleanup --task 3         # Apply run retention once
//!   cronclaw runs summary                  # Run counts per task

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use cronclaw_core::CronClawConfig;
use cronclaw_core::types::{RunFilter, RunStatus, Task, TaskFilter, TaskStatus};
use cronclaw_db::SqliteStore;
use cronclaw_scheduler::{RunCleanup, RunService, SchedulerRuntime, TaskCache};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cronclaw",
    version,
    about = "⏰ CronClaw: cron-driven HTTP task scheduler"
)]
struct Cli {
    /// Config file (default: ~/.cronclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, executor and reconciliation scanner
    Serve,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Manage tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Inspect and prune runs
    #[command(subcommand)]
    Runs(RunsCommand),
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task from a TOML file
    Add { file: PathBuf },
    /// List tasks
    List {
        /// ENABLED or DISABLED
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Substring of the name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Print one task as JSON
    Show { id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    /// Soft-delete a task
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// Runs of one task, newest first
    List {
        #[arg(long)]
        task: i64,
        /// Comma-separated statuses, e.g. FAILED,TIMEOUT
        #[arg(long, value_delimiter = ',')]
        status: Vec<RunStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// SCHEDULED, RUNNING and CALLBACK_PENDING runs
    Active {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Status distribution and latency of one task
    Stats {
        #[arg(long)]
        task: i64,
    },
    /// Run counts per task, largest first
    Summary {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Apply run retention once
    Cleanup {
        /// Only this task's runs
        #[arg(long)]
        task: Option<i64>,
        /// Override cleanup.max_age_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
        /// Override cleanup.max_per_task
        #[arg(long)]
        max_per_task: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "cronclaw=debug,cronclaw_scheduler=debug,cronclaw_db=debug"
    } else {
        "cronclaw=info,cronclaw_scheduler=info,cronclaw_db=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::Init { force } = cli.command {
        return init(cli.config, force);
    }

    let config = match &cli.config {
        Some(path) => CronClawConfig::load_from(path)?,
        None => CronClawConfig::load()?,
    };
    let store = Arc::new(SqliteStore::open(&config.database.resolved_path())?);

    match cli.command {
        Command::Serve => serve(config, store).await,
        Command::Task(cmd) => task_command(cmd, store).await,
        Command::Runs(cmd) => runs_command(cmd, config, store).await,
        Command::Init { .. } => Ok(()),
    }
}

fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(CronClawConfig::default_path);
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    CronClawConfig::default().save_to(&path)?;
    println!("✅ Config written to {}", path.display());
    Ok(())
}

async fn serve(config: CronClawConfig, store: Arc<SqliteStore>) -> Result<()> {
    let runtime = SchedulerRuntime::new(config, store.clone(), store)?;
    runtime.start().await?;
    for (name, health) in runtime.health() {
        tracing::debug!("{name}: {health:?}");
    }
    println!("⏰ CronClaw running with {} enabled task(s). Ctrl-C to stop.", runtime.tasks().len());

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    runtime.stop().await?;
    Ok(())
}

async fn task_command(cmd: TaskCommand, store: Arc<SqliteStore>) -> Result<()> {
    let tasks = TaskCache::new(store);
    match cmd {
        TaskCommand::Add { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let task: Task = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let task = tasks.create(task).await?;
            println!("✅ Task '{}' created with id {} [{}]", task.name, task.id, task.status);
        }
        TaskCommand::List { status, name, limit, offset } => {
            let filter = TaskFilter {
                status,
                name_like: name,
                ..Default::default()
            };
            let (list, total) = tasks.list(&filter, limit, offset).await?;
            for t in &list {
                println!(
                    "{:>5}  {:<8}  {:<20}  {}  → {}{}",
                    t.id, t.status.as_str(), t.cron_expr, t.name, t.target_service, t.target_path
                );
            }
            println!("({} of {total})", list.len());
        }
        TaskCommand::Show { id } => {
            let task = tasks
                .get(id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(task.as_ref())?);
        }
        TaskCommand::Enable { id } => {
            let task = tasks.update_status(id, TaskStatus::Enabled).await?;
            println!("▶️  Task '{}' enabled (v{})", task.name, task.version);
        }
        TaskCommand::Disable { id } => {
            let task = tasks.update_status(id, TaskStatus::Disabled).await?;
            println!("⏸️  Task '{}' disabled (v{})", task.name, task.version);
        }
        TaskCommand::Delete { id } => {
            tasks.delete(id).await?;
            println!("🗑️  Task {id} deleted");
        }
    }
    Ok(())
}

async fn runs_command(cmd: RunsCommand, config: CronClawConfig, store: Arc<SqliteStore>) -> Result<()> {
    let runs = Arc::new(RunService::new(store));
    match cmd {
        RunsCommand::List { task, status, limit, offset } => {
            let filter = RunFilter::with_statuses(&status);
            for run in runs.list_by_task(task, &filter, limit, offset).await? {
                print_run(&run);
            }
        }
        RunsCommand::Active { limit } => {
            for run in runs.list_active(limit, 0).await? {
                print_run(&run);
            }
        }
        RunsCommand::Stats { task } => {
            let stats = runs.stats(task).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        RunsCommand::Summary { limit } => {
            let cleanup = RunCleanup::new(config.cleanup, runs);
            for entry in cleanup.summary(limit).await? {
                println!("task {:<6}  {} run(s)", entry.task_id, entry.count);
            }
        }
        RunsCommand::Cleanup { task, max_age_secs, max_per_task } => {
            let mut retention = config.cleanup;
            if let Some(age) = max_age_secs {
                retention.max_age_secs = age;
            }
            if let Some(keep) = max_per_task {
                retention.max_per_task = keep;
            }
            let (max_age, keep) = (retention.max_age_secs, retention.max_per_task);
            let cleanup = RunCleanup::new(retention, runs);
            let mut expired = 0;
            if max_age > 0 {
                let age = i64::try_from(max_age)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .context("max age out of range")?;
                expired = cleanup.cleanup_by_age(task, age, Utc::now()).await?;
            }
            let mut trimmed = 0;
            if keep > 0 {
                trimmed = cleanup.cleanup_by_keep(task, keep).await?;
            }
            println!("🧹 Removed {expired} expired and {trimmed} over-cap run(s)");
        }
    }
    Ok(())
}

fn print_run(run: &cronclaw_core::types::Run) {
    let detail = run
        .error_message
        .as_deref()
        .or(run.response_body.as_deref())
        .unwrap_or("");
    println!(
        "{:>6}  task {:<4}  {}  #{:<2}  {:<16}  {}",
        run.id,
        run.task_id,
        run.scheduled_time.format("%Y-%m-%d %H:%M:%S"),
        run.attempt,
        run.status.as_str(),
        detail
    );
}
