//! # CronClaw DB
//! SQLite persistence for tasks and runs.

mod run_store;
mod sqlite;
mod task_store;

pub use sqlite::SqliteStore;
