//! `TaskStore` over SQLite.

use async_trait::async_trait;
use chrono::Utc;
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::traits::TaskStore;
use cronclaw_core::types::{Task, TaskFilter, TaskStatus};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};

use crate::sqlite::{SqliteStore, db_err, fmt_ts, get_enum, get_ts};

const TASK_COLUMNS: &str = "id, name, description, cron_expr, timezone, exec_type, \
    target_service, target_path, http_method, headers_json, body_template, timeout_secs, \
    max_concurrency, concurrency_policy, overlap_action, failure_action, misfire_policy, \
    catchup_limit, callback_method, callback_timeout_secs, status, version, created_at, updated_at";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        cron_expr: row.get("cron_expr")?,
        timezone: row.get("timezone")?,
        exec_type: get_enum(row, "exec_type")?,
        target_service: row.get("target_service")?,
        target_path: row.get("target_path")?,
        http_method: row.get("http_method")?,
        headers_json: row.get("headers_json")?,
        body_template: row.get("body_template")?,
        timeout_secs: row.get("timeout_secs")?,
        max_concurrency: row.get("max_concurrency")?,
        concurrency_policy: get_enum(row, "concurrency_policy")?,
        overlap_action: get_enum(row, "overlap_action")?,
        failure_action: get_enum(row, "failure_action")?,
        misfire_policy: get_enum(row, "misfire_policy")?,
        catchup_limit: row.get("catchup_limit")?,
        callback_method: row.get("callback_method")?,
        callback_timeout_secs: row.get("callback_timeout_secs")?,
        status: get_enum(row, "status")?,
        version: row.get("version")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

/// WHERE clause and bound values for a task filter. Always excludes deleted rows.
fn filter_clause(filter: &TaskFilter) -> (String, Vec<Value>) {
    let mut clauses = vec!["deleted = 0".to_string()];
    let mut values = Vec::new();
    if let Some(status) = filter.status {
        clauses.push("status = ?".into());
        values.push(Value::Text(status.as_str().into()));
    }
    if let Some(name) = filter.name_like.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("name LIKE ?".into());
        values.push(Value::Text(format!("%{name}%")));
    }
    if let Some(desc) = filter.description_like.as_deref().filter(|s| !s.is_empty()) {
        clauses.push("description LIKE ?".into());
        values.push(Value::Text(format!("%{desc}%")));
    }
    let ranges = [
        ("created_at >= ?", filter.created_from),
        ("created_at <= ?", filter.created_to),
        ("updated_at >= ?", filter.updated_from),
        ("updated_at <= ?", filter.updated_to),
    ];
    for (clause, ts) in ranges {
        if let Some(ts) = ts {
            clauses.push(clause.into());
            values.push(Value::Text(fmt_ts(ts)));
        }
    }
    (clauses.join(" AND "), values)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create(&self, task: &Task) -> Result<i64> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (name, description, cron_expr, timezone, exec_type, target_service,
                target_path, http_method, headers_json, body_template, timeout_secs, max_concurrency,
                concurrency_policy, overlap_action, failure_action, misfire_policy, catchup_limit,
                callback_method, callback_timeout_secs, status, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, 1, ?21, ?21)",
            params![
                task.name,
                task.description,
                task.cron_expr,
                task.timezone,
                task.exec_type.as_str(),
                task.target_service,
                task.target_path,
                task.http_method,
                task.headers_json,
                task.body_template,
                task.timeout_secs,
                task.max_concurrency,
                task.concurrency_policy.as_str(),
                task.overlap_action.as_str(),
                task.failure_action.as_str(),
                task.misfire_policy.as_str(),
                task.catchup_limit,
                task.callback_method,
                task.callback_timeout_secs,
                task.status.as_str(),
                now,
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND deleted = 0"),
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_enabled(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'ENABLED' AND deleted = 0 ORDER BY id"
            ))
            .map_err(db_err)?;
        let tasks = stmt
            .query_map([], row_to_task)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(tasks)
    }

    async fn list_filtered(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<Vec<Task>> {
        let (clause, mut values) = filter_clause(filter);
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE {clause} ORDER BY id DESC LIMIT ? OFFSET ?"
            ))
            .map_err(db_err)?;
        let tasks = stmt
            .query_map(params_from_iter(values), row_to_task)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(tasks)
    }

    async fn count_filtered(&self, filter: &TaskFilter) -> Result<u64> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM tasks WHERE {clause}"),
                params_from_iter(values),
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn update_meta(&self, task: &Task) -> Result<i64> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE tasks SET name = ?1, description = ?2, cron_expr = ?3, timezone = ?4,
                    exec_type = ?5, target_service = ?6, target_path = ?7, http_method = ?8,
                    headers_json = ?9, body_template = ?10, timeout_secs = ?11,
                    max_concurrency = ?12, concurrency_policy = ?13, overlap_action = ?14,
                    failure_action = ?15, misfire_policy = ?16, catchup_limit = ?17,
                    callback_method = ?18, callback_timeout_secs = ?19,
                    version = version + 1, updated_at = ?20
                 WHERE id = ?21 AND version = ?22 AND deleted = 0",
                params![
                    task.name,
                    task.description,
                    task.cron_expr,
                    task.timezone,
                    task.exec_type.as_str(),
                    task.target_service,
                    task.target_path,
                    task.http_method,
                    task.headers_json,
                    task.body_template,
                    task.timeout_secs,
                    task.max_concurrency,
                    task.concurrency_policy.as_str(),
                    task.overlap_action.as_str(),
                    task.failure_action.as_str(),
                    task.misfire_policy.as_str(),
                    task.catchup_limit,
                    task.callback_method,
                    task.callback_timeout_secs,
                    now,
                    task.id,
                    task.version,
                ],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(task.version + 1);
        }
        // Tell a stale version apart from a missing row
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM tasks WHERE id = ?1 AND deleted = 0",
                params![task.id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match exists {
            Some(_) => Err(CronClawError::VersionConflict {
                id: task.id,
                expected: task.version,
            }),
            None => Err(CronClawError::TaskNotFound(task.id)),
        }
    }

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<i64> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND deleted = 0",
                params![status.as_str(), now, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CronClawError::TaskNotFound(id));
        }
        conn.query_row("SELECT version FROM tasks WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(db_err)
    }

    async fn soft_delete(&self, id: i64) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET deleted = 1, status = 'DISABLED', version = version + 1,
                    updated_at = ?1
                 WHERE id = ?2 AND deleted = 0",
                params![now, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CronClawError::TaskNotFound(id));
        }
        Ok(())
    }
}
