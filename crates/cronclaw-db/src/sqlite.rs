//! SQLite store shared by the task and run store implementations.
//!
//! All timestamps are stored as RFC 3339 UTC text with millisecond precision,
//! so text comparison matches time order.

use chrono::{DateTime, SecondsFormat, Utc};
use cronclaw_core::error::{CronClawError, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use rusqlite::types::Type;
use std::path::Path;
use std::str::FromStr;

/// Task and run store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        tracing::info!("🗄️ Store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                cron_expr TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                exec_type TEXT NOT NULL,          -- 'SYNC', 'ASYNC'
                target_service TEXT NOT NULL,
                target_path TEXT NOT NULL,
                http_method TEXT NOT NULL,
                headers_json TEXT NOT NULL DEFAULT '{}',
                body_template TEXT NOT NULL DEFAULT '',
                timeout_secs INTEGER NOT NULL DEFAULT 0,
                max_concurrency INTEGER NOT NULL DEFAULT 1,
                concurrency_policy TEXT NOT NULL,
                overlap_action TEXT NOT NULL,
                failure_action TEXT NOT NULL,
                misfire_policy TEXT NOT NULL DEFAULT 'FIRE_NOW',
                catchup_limit INTEGER NOT NULL DEFAULT 0,
                callback_method TEXT NOT NULL DEFAULT 'POST',
                callback_timeout_secs INTEGER NOT NULL DEFAULT 300,
                status TEXT NOT NULL DEFAULT 'DISABLED',
                version INTEGER NOT NULL DEFAULT 1,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, deleted);

            -- One row per firing; (task_id, scheduled_time) is unique
            CREATE TABLE IF NOT EXISTS task_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                scheduled_time TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                exec_type TEXT NOT NULL,
                snapshot TEXT NOT NULL,           -- JSON RunSnapshot
                request_snapshot TEXT,
                response_code INTEGER,
                response_body TEXT,
                error_message TEXT,
                callback_token TEXT,
                callback_deadline TEXT,
                trace_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uq_task_runs_task_time
                ON task_runs(task_id, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_task_runs_status ON task_runs(status);
            CREATE INDEX IF NOT EXISTS idx_task_runs_deadline
                ON task_runs(status, callback_deadline);
            ",
            )
            .map_err(db_err)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> CronClawError {
    CronClawError::Database(e.to_string())
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn get_ts(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let idx = row.as_ref().column_index(name)?;
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn get_opt_ts(
    row: &rusqlite::Row<'_>,
    name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let idx = row.as_ref().column_index(name)?;
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

/// Read a text column into a `FromStr` enum.
pub(crate) fn get_enum<T>(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = CronClawError>,
{
    let idx = row.as_ref().column_index(name)?;
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

/// `'A','B'` list for an `IN (...)` clause over enum strings.
pub(crate) fn quoted_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `?,?,?` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}
