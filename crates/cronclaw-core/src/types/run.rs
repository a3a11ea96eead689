//! Runs: one firing of a task, tracked through a strict state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::string_enum;
use super::task::{ExecType, Task};
use crate::error::Result;

string_enum! {
    /// Run state machine.
    ///
    /// ```text
    /// SCHEDULED ──claim──▶ RUNNING ──▶ SUCCESS | FAILED | TIMEOUT | CANCELED
    ///     │                   └──────▶ CALLBACK_PENDING ──▶ SUCCESS | CALLBACK_FAILED | FAILED_TIMEOUT
    ///     └──▶ SKIPPED | FAILURE_SKIP | CONCURRENT_SKIP | OVERLAP_SKIP
    /// any non-terminal ──cancel──▶ CANCELED
    /// ```
    pub enum RunStatus {
        Scheduled => "SCHEDULED",
        Running => "RUNNING",
        Success => "SUCCESS",
        Failed => "FAILED",
        Timeout => "TIMEOUT",
        CallbackPending => "CALLBACK_PENDING",
        CallbackFailed => "CALLBACK_FAILED",
        FailedTimeout => "FAILED_TIMEOUT",
        Canceled => "CANCELED",
        Skipped => "SKIPPED",
        FailureSkip => "FAILURE_SKIP",
        ConcurrentSkip => "CONCURRENT_SKIP",
        OverlapSkip => "OVERLAP_SKIP",
    }
}

impl RunStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled | Self::Running | Self::CallbackPending)
    }

    /// Statuses that trigger the task's failure policy.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Timeout | Self::FailedTimeout | Self::Canceled
        )
    }

    /// Audit rows that were never dispatched.
    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::FailureSkip | Self::ConcurrentSkip | Self::OverlapSkip
        )
    }

    /// Statuses a run may be in immediately before moving to `self`.
    pub fn allowed_sources(&self) -> &'static [RunStatus] {
        use RunStatus::*;
        match self {
            Scheduled => &[],
            Running => &[Scheduled],
            Success => &[Running, CallbackPending],
            Failed | Timeout | CallbackPending => &[Running],
            CallbackFailed | FailedTimeout => &[CallbackPending],
            Canceled => &[Scheduled, Running, CallbackPending],
            Skipped | FailureSkip | ConcurrentSkip | OverlapSkip => &[Scheduled],
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        next.allowed_sources().contains(self)
    }

    /// Non-terminal statuses.
    pub fn active() -> &'static [RunStatus] {
        &[Self::Scheduled, Self::Running, Self::CallbackPending]
    }
}

/// Task fields frozen into a run at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub target_service: String,
    pub target_path: String,
    pub http_method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub timeout_secs: i64,
    pub exec_type: ExecType,
    pub callback_method: String,
    pub callback_timeout_secs: i64,
}

impl RunSnapshot {
    pub fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            target_service: task.target_service.clone(),
            target_path: task.target_path.clone(),
            http_method: task.http_method.clone(),
            headers: task.headers()?,
            body: task.body_template.clone(),
            timeout_secs: task.timeout_secs,
            exec_type: task.exec_type,
            callback_method: task.callback_method.clone(),
            callback_timeout_secs: task.callback_timeout_secs,
        })
    }
}

/// A persisted run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub task_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub attempt: u32,
    pub snapshot: RunSnapshot,
    /// Effective request as sent, sensitive headers masked.
    pub request_snapshot: Option<String>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub callback_token: Option<String>,
    pub callback_deadline: Option<DateTime<Utc>>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn exec_type(&self) -> ExecType {
        self.snapshot.exec_type
    }
}

/// Input for creating a SCHEDULED run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub attempt: u32,
    pub snapshot: RunSnapshot,
    /// Generated when absent.
    pub trace_id: Option<String>,
}

impl NewRun {
    pub fn for_task(task: &Task, scheduled_time: DateTime<Utc>, attempt: u32) -> Result<Self> {
        Ok(Self {
            task_id: task.id,
            scheduled_time,
            attempt,
            snapshot: RunSnapshot::from_task(task)?,
            trace_id: None,
        })
    }
}

/// A guarded status change plus the fields it writes.
///
/// Stores apply it only when the run's current status is one of
/// `status.allowed_sources()`. `None` fields are left untouched.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub callback_token: Option<String>,
    pub callback_deadline: Option<DateTime<Utc>>,
}

impl RunTransition {
    pub fn to(status: RunStatus) -> Self {
        Self {
            status,
            start_time: None,
            end_time: None,
            response_code: None,
            response_body: None,
            error_message: None,
            callback_token: None,
            callback_deadline: None,
        }
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn with_response(mut self, code: i32, body: impl Into<String>) -> Self {
        self.response_code = Some(code);
        self.response_body = Some(body.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_callback(mut self, token: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        self.callback_token = Some(token.into());
        self.callback_deadline = Some(deadline);
        self
    }
}

/// Number of runs of one task in one status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: RunStatus,
    pub count: u64,
}

/// Number of stored runs of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunCount {
    pub task_id: i64,
    pub count: u64,
}

/// Average latencies over a task's runs, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// start_time - scheduled_time
    pub avg_wait_ms: Option<f64>,
    /// end_time - start_time
    pub avg_exec_ms: Option<f64>,
}

/// Status distribution of a task's runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub task_id: i64,
    pub total: u64,
    pub counts: BTreeMap<String, u64>,
    pub ratios: BTreeMap<String, f64>,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub latency: LatencyStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_set() {
        let terminal: Vec<_> = RunStatus::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal.len(), 10);
        assert!(!RunStatus::CallbackPending.is_terminal());
    }

    #[test]
    fn test_no_edge_leaves_terminal() {
        for from in RunStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_edges() {
        use RunStatus::*;
        assert!(Scheduled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(Running.can_transition_to(CallbackPending));
        assert!(CallbackPending.can_transition_to(Success));
        assert!(CallbackPending.can_transition_to(FailedTimeout));
        assert!(!Running.can_transition_to(FailedTimeout));
        assert!(Scheduled.can_transition_to(OverlapSkip));
        assert!(!Running.can_transition_to(OverlapSkip));
        for s in RunStatus::active() {
            assert!(s.can_transition_to(Canceled));
        }
    }

    #[test]
    fn test_snapshot_from_task() {
        let mut task = Task::new("t", "* * * * * *", "svc", "/hook");
        task.headers_json = r#"{"Authorization":"Bearer x"}"#.into();
        task.body_template = "{\"a\":1}".into();
        let snap = RunSnapshot::from_task(&task).unwrap();
        assert_eq!(snap.headers.get("Authorization").map(String::as_str), Some("Bearer x"));
        assert_eq!(snap.body, "{\"a\":1}");
        assert_eq!(snap.exec_type, ExecType::Sync);
    }
}
