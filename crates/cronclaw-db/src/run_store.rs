//! `RunStore` over SQLite.
//!
//! Status changes are guarded in SQL: an UPDATE only matches when the current
//! status is an allowed source of the target status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::traits::RunStore;
use cronclaw_core::types::{
    LatencyStats, NewRun, Run, RunFilter, RunSnapshot, RunStatus, RunTransition, StatusCount,
    TaskRunCount,
};
use rusqlite::types::{Type, Value};
use rusqlite::{ErrorCode, OptionalExtension, params, params_from_iter};

use crate::sqlite::{
    SqliteStore, db_err, fmt_opt_ts, fmt_ts, get_enum, get_opt_ts, get_ts, placeholders,
    quoted_list,
};

const RUN_COLUMNS: &str = "id, task_id, scheduled_time, start_time, end_time, status, attempt, \
    snapshot, request_snapshot, response_code, response_body, error_message, callback_token, \
    callback_deadline, trace_id, created_at, updated_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let raw: String = row.get("snapshot")?;
    let snapshot: RunSnapshot = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(Run {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        scheduled_time: get_ts(row, "scheduled_time")?,
        start_time: get_opt_ts(row, "start_time")?,
        end_time: get_opt_ts(row, "end_time")?,
        status: get_enum(row, "status")?,
        attempt: row.get("attempt")?,
        snapshot,
        request_snapshot: row.get("request_snapshot")?,
        response_code: row.get("response_code")?,
        response_body: row.get("response_body")?,
        error_message: row.get("error_message")?,
        callback_token: row.get("callback_token")?,
        callback_deadline: get_opt_ts(row, "callback_deadline")?,
        trace_id: row.get("trace_id")?,
        created_at: get_ts(row, "created_at")?,
        updated_at: get_ts(row, "updated_at")?,
    })
}

fn status_strs(statuses: &[RunStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

impl SqliteStore {
    fn query_runs(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let runs = stmt
            .query_map(params_from_iter(values), row_to_run)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_scheduled(&self, run: &NewRun) -> Result<Run> {
        let now = Utc::now();
        let trace_id = run
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let snapshot = serde_json::to_string(&run.snapshot)?;
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO task_runs (task_id, scheduled_time, status, attempt, exec_type, snapshot,
                trace_id, created_at, updated_at)
             VALUES (?1, ?2, 'SCHEDULED', ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                run.task_id,
                fmt_ts(run.scheduled_time),
                run.attempt,
                run.snapshot.exec_type.as_str(),
                snapshot,
                trace_id,
                fmt_ts(now),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(CronClawError::DuplicateRun {
                    task_id: run.task_id,
                    scheduled_time: run.scheduled_time,
                });
            }
            Err(e) => return Err(db_err(e)),
        }
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .map_err(db_err)
    }

    async fn get(&self, id: i64) -> Result<Option<Run>> {
        self.conn()
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
                params![id],
                row_to_run,
            )
            .optional()
            .map_err(db_err)
    }

    async fn exists_at(&self, task_id: i64, scheduled_time: DateTime<Utc>) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM task_runs WHERE task_id = ?1 AND scheduled_time = ?2",
                params![task_id, fmt_ts(scheduled_time)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn transition(&self, id: i64, change: &RunTransition) -> Result<bool> {
        let sources = change.status.allowed_sources();
        if sources.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE task_runs SET status = ?1,
                start_time = COALESCE(?2, start_time),
                end_time = COALESCE(?3, end_time),
                response_code = COALESCE(?4, response_code),
                response_body = COALESCE(?5, response_body),
                error_message = COALESCE(?6, error_message),
                callback_token = COALESCE(?7, callback_token),
                callback_deadline = COALESCE(?8, callback_deadline),
                updated_at = ?9
             WHERE id = ?10 AND status IN ({})",
            quoted_list(&status_strs(sources))
        );
        let changed = self
            .conn()
            .execute(
                &sql,
                params![
                    change.status.as_str(),
                    fmt_opt_ts(change.start_time),
                    fmt_opt_ts(change.end_time),
                    change.response_code,
                    change.response_body,
                    change.error_message,
                    change.callback_token,
                    fmt_opt_ts(change.callback_deadline),
                    fmt_ts(Utc::now()),
                    id,
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    async fn list_by_task(&self, task_id: i64, filter: &RunFilter, limit: usize, offset: usize) -> Result<Vec<Run>> {
        let mut clauses = vec!["task_id = ?".to_string()];
        let mut values = vec![Value::Integer(task_id)];
        if !filter.statuses.is_empty() {
            clauses.push(format!("status IN ({})", placeholders(filter.statuses.len())));
            values.extend(filter.statuses.iter().map(|s| Value::Text(s.as_str().into())));
        }
        let column = filter.time_field.column();
        if let Some(from) = filter.from {
            clauses.push(format!("{column} >= ?"));
            values.push(Value::Text(fmt_ts(from)));
        }
        if let Some(to) = filter.to {
            clauses.push(format!("{column} <= ?"));
            values.push(Value::Text(fmt_ts(to)));
        }
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE {} \
             ORDER BY scheduled_time DESC, id DESC LIMIT ? OFFSET ?",
            clauses.join(" AND ")
        );
        self.query_runs(&sql, values)
    }

    async fn list_active(&self, limit: usize, offset: usize) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE status IN ({}) \
             ORDER BY scheduled_time ASC, id ASC LIMIT ? OFFSET ?",
            quoted_list(&status_strs(RunStatus::active()))
        );
        self.query_runs(&sql, vec![Value::Integer(limit as i64), Value::Integer(offset as i64)])
    }

    async fn list_callback_pending_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs
             WHERE status = 'CALLBACK_PENDING' AND callback_deadline IS NOT NULL
               AND callback_deadline < ?
             ORDER BY callback_deadline ASC LIMIT ?"
        );
        self.query_runs(&sql, vec![Value::Text(fmt_ts(now)), Value::Integer(limit as i64)])
    }

    async fn list_sync_running_stuck(&self, stale_before: DateTime<Utc>, limit: usize) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs
             WHERE status = 'RUNNING' AND exec_type = 'SYNC'
               AND start_time IS NOT NULL AND start_time < ?1 AND updated_at < ?1
             ORDER BY start_time ASC LIMIT ?2"
        );
        self.query_runs(&sql, vec![Value::Text(fmt_ts(stale_before)), Value::Integer(limit as i64)])
    }

    async fn list_by_ids(&self, ids: &[i64]) -> Result<Vec<Run>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM task_runs WHERE id IN ({})",
            placeholders(ids.len())
        );
        self.query_runs(&sql, ids.iter().map(|id| Value::Integer(*id)).collect())
    }

    async fn count_status_by_task(&self, task_id: i64) -> Result<Vec<StatusCount>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) AS n FROM task_runs WHERE task_id = ?1
                 GROUP BY status ORDER BY status",
            )
            .map_err(db_err)?;
        let counts = stmt
            .query_map(params![task_id], |row| {
                let n: i64 = row.get("n")?;
                Ok(StatusCount {
                    status: get_enum(row, "status")?,
                    count: n as u64,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(counts)
    }

    async fn latency_by_task(&self, task_id: i64) -> Result<LatencyStats> {
        self.conn()
            .query_row(
                "SELECT
                    AVG(CASE WHEN start_time IS NOT NULL
                        THEN (julianday(start_time) - julianday(scheduled_time)) * 86400000.0 END),
                    AVG(CASE WHEN start_time IS NOT NULL AND end_time IS NOT NULL
                        THEN (julianday(end_time) - julianday(start_time)) * 86400000.0 END)
                 FROM task_runs WHERE task_id = ?1",
                params![task_id],
                |r| {
                    Ok(LatencyStats {
                        avg_wait_ms: r.get(0)?,
                        avg_exec_ms: r.get(1)?,
                    })
                },
            )
            .map_err(db_err)
    }

    async fn update_request_snapshot(&self, id: i64, snapshot: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE task_runs SET request_snapshot = ?1 WHERE id = ?2",
                params![snapshot, id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn count_per_task(&self, limit: usize) -> Result<Vec<TaskRunCount>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT task_id, COUNT(*) AS n FROM task_runs
                 GROUP BY task_id ORDER BY n DESC, task_id LIMIT ?1",
            )
            .map_err(db_err)?;
        let counts = stmt
            .query_map(params![limit as i64], |r| {
                let n: i64 = r.get("n")?;
                Ok(TaskRunCount {
                    task_id: r.get("task_id")?,
                    count: n as u64,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(counts)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, task_id: Option<i64>, limit: usize) -> Result<u64> {
        let n = self
            .conn()
            .execute(
                "DELETE FROM task_runs WHERE id IN (
                    SELECT id FROM task_runs
                    WHERE scheduled_time < ?1 AND (?2 IS NULL OR task_id = ?2)
                    ORDER BY scheduled_time LIMIT ?3
                 )",
                params![fmt_ts(cutoff), task_id, limit as i64],
            )
            .map_err(db_err)?;
        Ok(n as u64)
    }

    async fn list_ids_beyond(&self, task_id: i64, keep: u32, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM task_runs WHERE task_id = ?1
                 ORDER BY scheduled_time DESC, id DESC LIMIT ?2 OFFSET ?3",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![task_id, limit as i64, keep], |r| r.get(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM task_runs WHERE id IN ({})", placeholders(ids.len()));
        let n = self
            .conn()
            .execute(&sql, params_from_iter(ids.iter()))
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cronclaw_core::types::{ExecType, RunTimeField, Task};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, h, m, s).unwrap()
    }

    fn new_run(task_id: i64, when: DateTime<Utc>, exec: ExecType) -> NewRun {
        let mut task = Task::new("t", "* * * * * *", "svc", "/hook");
        task.id = task_id;
        task.exec_type = exec;
        NewRun::for_task(&task, when, 1).unwrap()
    }

    #[tokio::test]
    async fn test_unique_per_instant() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Sync)).await.unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);
        assert_eq!(run.trace_id.len(), 32);
        assert!(store.exists_at(1, at(8, 0, 0)).await.unwrap());
        assert!(!store.exists_at(2, at(8, 0, 0)).await.unwrap());

        let err = store
            .create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Sync))
            .await
            .unwrap_err();
        assert!(matches!(err, CronClawError::DuplicateRun { task_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_claim_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Sync)).await.unwrap();
        let claim = RunTransition::to(RunStatus::Running).started_at(Utc::now());
        assert!(store.transition(run.id, &claim).await.unwrap());
        assert!(!store.transition(run.id, &claim).await.unwrap());
        let loaded = RunStore::get(&store, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.start_time.is_some());
    }

    #[tokio::test]
    async fn test_terminal_is_final() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Sync)).await.unwrap();
        let skip = RunTransition::to(RunStatus::OverlapSkip).ended_at(Utc::now());
        assert!(store.transition(run.id, &skip).await.unwrap());
        for next in [RunStatus::Running, RunStatus::Canceled, RunStatus::Success] {
            assert!(!store.transition(run.id, &RunTransition::to(next)).await.unwrap());
        }
        let loaded = RunStore::get(&store, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::OverlapSkip);
    }

    #[tokio::test]
    async fn test_callback_expiry_listing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Async)).await.unwrap();
        store
            .transition(run.id, &RunTransition::to(RunStatus::Running).started_at(at(8, 0, 0)))
            .await
            .unwrap();
        let deadline = at(8, 5, 0);
        store
            .transition(
                run.id,
                &RunTransition::to(RunStatus::CallbackPending)
                    .with_response(200, "accepted")
                    .with_callback("tok", deadline),
            )
            .await
            .unwrap();

        assert!(store.list_callback_pending_expired(at(8, 4, 59), 10).await.unwrap().is_empty());
        let expired = store.list_callback_pending_expired(at(8, 5, 1), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].response_code, Some(200));
        assert_eq!(expired[0].callback_deadline, Some(deadline));
    }

    #[tokio::test]
    async fn test_stuck_sync_listing_ignores_async() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sync = store.create_scheduled(&new_run(1, at(8, 0, 0), ExecType::Sync)).await.unwrap();
        let asyn = store.create_scheduled(&new_run(2, at(8, 0, 0), ExecType::Async)).await.unwrap();
        let started = Utc::now() - Duration::hours(1);
        for id in [sync.id, asyn.id] {
            let claim = RunTransition::to(RunStatus::Running).started_at(started);
            store.transition(id, &claim).await.unwrap();
        }
        let stuck = store
            .list_sync_running_stuck(Utc::now() + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, sync.id);
        // updated_at was just written, so nothing is stale yet
        assert!(store
            .list_sync_running_stuck(Utc::now() - Duration::minutes(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_listing_filters_and_stats() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for s in 0..4 {
            let run = store.create_scheduled(&new_run(1, at(9, 0, s), ExecType::Sync)).await.unwrap();
            ids.push(run.id);
        }
        let claim = RunTransition::to(RunStatus::Running).started_at(at(9, 0, 1));
        store.transition(ids[0], &claim).await.unwrap();
        store
            .transition(ids[0], &RunTransition::to(RunStatus::Success).ended_at(at(9, 0, 3)))
            .await
            .unwrap();
        store
            .transition(ids[1], &RunTransition::to(RunStatus::ConcurrentSkip))
            .await
            .unwrap();

        let all = store.list_by_task(1, &RunFilter::default(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].scheduled_time, at(9, 0, 3));

        let scheduled = store
            .list_by_task(1, &RunFilter::with_statuses(&[RunStatus::Scheduled]), 10, 0)
            .await
            .unwrap();
        assert_eq!(scheduled.len(), 2);

        let ranged = RunFilter {
            time_field: RunTimeField::ScheduledTime,
            from: Some(at(9, 0, 1)),
            to: Some(at(9, 0, 2)),
            ..Default::default()
        };
        assert_eq!(store.list_by_task(1, &ranged, 10, 0).await.unwrap().len(), 2);

        assert_eq!(store.list_active(10, 0).await.unwrap().len(), 2);
        assert_eq!(store.list_by_ids(&ids[..2]).await.unwrap().len(), 2);

        let counts = store.count_status_by_task(1).await.unwrap();
        assert_eq!(counts.len(), 3);

        let latency = store.latency_by_task(1).await.unwrap();
        let wait = latency.avg_wait_ms.unwrap();
        let exec = latency.avg_exec_ms.unwrap();
        assert!((wait - 1000.0).abs() < 1.0);
        assert!((exec - 2000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_retention() {
        let store = SqliteStore::open_in_memory().unwrap();
        for task_id in [1, 2] {
            for s in 0..5 {
                store
                    .create_scheduled(&new_run(task_id, at(10, 0, s), ExecType::Sync))
                    .await
                    .unwrap();
            }
        }
        store.create_scheduled(&new_run(3, at(10, 0, 0), ExecType::Sync)).await.unwrap();

        let counts = store.count_per_task(10).await.unwrap();
        assert_eq!(counts.len(), 3);
        assert_eq!(counts[0], TaskRunCount { task_id: 1, count: 5 });
        assert_eq!(counts[2], TaskRunCount { task_id: 3, count: 1 });
        assert_eq!(store.count_per_task(1).await.unwrap().len(), 1);

        // Newest first, past the newest three, one page at a time
        let beyond = store.list_ids_beyond(1, 3, 10).await.unwrap();
        assert_eq!(beyond.len(), 2);
        assert_eq!(store.list_ids_beyond(1, 3, 1).await.unwrap(), beyond[..1].to_vec());
        assert!(store.list_ids_beyond(3, 3, 10).await.unwrap().is_empty());
        assert_eq!(store.delete_by_ids(&beyond).await.unwrap(), 2);
        let remaining = store.list_by_task(1, &RunFilter::default(), 10, 0).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[2].scheduled_time, at(10, 0, 2));

        // Scoped to task 2, bounded by the limit
        assert_eq!(store.delete_older_than(at(10, 0, 3), Some(2), 2).await.unwrap(), 2);
        assert_eq!(store.delete_older_than(at(10, 0, 3), Some(2), 2).await.unwrap(), 1);
        assert_eq!(store.list_by_task(1, &RunFilter::default(), 10, 0).await.unwrap().len(), 3);
        assert_eq!(store.delete_older_than(at(10, 0, 3), None, 100).await.unwrap(), 2);
        assert!(store.list_by_task(3, &RunFilter::default(), 10, 0).await.unwrap().is_empty());
    }
}
