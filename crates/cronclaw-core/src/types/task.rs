//! Task definitions: what to call, when, and under which policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::string_enum;
use crate::error::{CronClawError, Result};

string_enum! {
    /// SYNC runs complete within the HTTP call; ASYNC runs wait for a callback.
    pub enum ExecType {
        Sync => "SYNC",
        Async => "ASYNC",
    }
}

string_enum! {
    /// What to do when a task's active runs reach its max concurrency.
    pub enum ConcurrencyPolicy {
        /// Declared but not implemented as a queue: the firing is dropped.
        Queue => "QUEUE",
        Skip => "SKIP",
        Parallel => "PARALLEL",
    }
}

string_enum! {
    /// What to do when a new instant is due while a prior run is still pending.
    pub enum OverlapAction {
        Skip => "SKIP",
        CancelPrev => "CANCEL_PREV",
        Parallel => "PARALLEL",
        Allow => "ALLOW",
    }
}

string_enum! {
    /// What to do after the latest effective run failed.
    pub enum FailureAction {
        Skip => "SKIP",
        Retry => "RETRY",
        RunNew => "RUN_NEW",
    }
}

string_enum! {
    /// Which missed instants are fired when the window covers several.
    pub enum MisfirePolicy {
        FireNow => "FIRE_NOW",
        Skip => "SKIP",
        CatchUpLimited => "CATCH_UP_LIMITED",
    }
}

string_enum! {
    pub enum TaskStatus {
        Enabled => "ENABLED",
        Disabled => "DISABLED",
    }
}

impl Default for ExecType {
    fn default() -> Self { Self::Sync }
}
impl Default for ConcurrencyPolicy {
    fn default() -> Self { Self::Skip }
}
impl Default for OverlapAction {
    fn default() -> Self { Self::Allow }
}
impl Default for FailureAction {
    fn default() -> Self { Self::RunNew }
}
impl Default for MisfirePolicy {
    fn default() -> Self { Self::FireNow }
}
impl Default for TaskStatus {
    fn default() -> Self { Self::Disabled }
}

/// A scheduling definition.
///
/// `headers_json` is a JSON object of string values; `body_template` is sent verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Six fields: second minute hour day month weekday.
    pub cron_expr: String,
    /// "UTC" or a fixed offset such as "+07:00".
    pub timezone: String,
    pub exec_type: ExecType,
    pub target_service: String,
    pub target_path: String,
    pub http_method: String,
    pub headers_json: String,
    pub body_template: String,
    pub timeout_secs: i64,
    pub max_concurrency: u32,
    pub concurrency_policy: ConcurrencyPolicy,
    pub overlap_action: OverlapAction,
    pub failure_action: FailureAction,
    pub misfire_policy: MisfirePolicy,
    pub catchup_limit: u32,
    pub callback_method: String,
    pub callback_timeout_secs: i64,
    pub status: TaskStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Task {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            description: String::new(),
            cron_expr: String::new(),
            timezone: "UTC".into(),
            exec_type: ExecType::Sync,
            target_service: String::new(),
            target_path: "/".into(),
            http_method: "POST".into(),
            headers_json: "{}".into(),
            body_template: String::new(),
            timeout_secs: 0,
            max_concurrency: 1,
            concurrency_policy: ConcurrencyPolicy::default(),
            overlap_action: OverlapAction::default(),
            failure_action: FailureAction::default(),
            misfire_policy: MisfirePolicy::default(),
            catchup_limit: 0,
            callback_method: "POST".into(),
            callback_timeout_secs: 300,
            status: TaskStatus::Disabled,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Task {
    /// Create a task with the given name, schedule and target; everything else defaulted.
    pub fn new(name: &str, cron_expr: &str, target_service: &str, target_path: &str) -> Self {
        Self {
            name: name.to_string(),
            cron_expr: normalize_cron(cron_expr),
            target_service: target_service.to_string(),
            target_path: target_path.to_string(),
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == TaskStatus::Enabled
    }

    /// Parse `headers_json` into a sorted map.
    pub fn headers(&self) -> Result<BTreeMap<String, String>> {
        parse_headers(&self.headers_json)
    }

    /// Fill blanks with defaults and check field-level constraints.
    /// Cron syntax is checked by the scheduler, not here.
    pub fn normalize(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CronClawError::InvalidArgument("name is required".into()));
        }
        self.cron_expr = normalize_cron(&self.cron_expr);
        if self.cron_expr.is_empty() {
            return Err(CronClawError::InvalidArgument("cron_expr is required".into()));
        }
        if self.target_service.trim().is_empty() {
            return Err(CronClawError::InvalidArgument("target_service is required".into()));
        }
        if self.timezone.trim().is_empty() {
            self.timezone = "UTC".into();
        }
        if self.http_method.trim().is_empty() {
            self.http_method = "POST".into();
        }
        self.http_method = self.http_method.trim().to_ascii_uppercase();
        if self.callback_method.trim().is_empty() {
            self.callback_method = "POST".into();
        }
        if self.headers_json.trim().is_empty() {
            self.headers_json = "{}".into();
        }
        parse_headers(&self.headers_json)?;
        if !self.target_path.starts_with('/') {
            self.target_path = format!("/{}", self.target_path);
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = 1;
        }
        if self.callback_timeout_secs <= 0 {
            self.callback_timeout_secs = 300;
        }
        if self.misfire_policy == MisfirePolicy::CatchUpLimited && self.catchup_limit == 0 {
            self.catchup_limit = 1;
        }
        Ok(())
    }
}

/// Accept five-field expressions by prepending a zero seconds field.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Parse a JSON object of header values. Non-string scalars are stringified.
pub fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| CronClawError::InvalidArgument("headers must be a JSON object".into()))?;
    Ok(obj
        .iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  1  2 3 * * * "), "1 2 3 * * *");
    }

    #[test]
    fn test_enum_strings() {
        assert_eq!(OverlapAction::CancelPrev.as_str(), "CANCEL_PREV");
        assert_eq!("cancel_prev".parse::<OverlapAction>().unwrap(), OverlapAction::CancelPrev);
        assert!("bogus".parse::<FailureAction>().is_err());
        let json = serde_json::to_string(&MisfirePolicy::CatchUpLimited).unwrap();
        assert_eq!(json, "\"CATCH_UP_LIMITED\"");
    }

    #[test]
    fn test_task_from_toml_defaults() {
        let task: Task = toml::from_str(
            r#"
            name = "nightly-report"
            cron_expr = "0 0 2 * *"
            target_service = "reports"
            target_path = "jobs/nightly"
            exec_type = "ASYNC"
            headers_json = '{"X-Team": "data", "X-Retry": 3}'
            "#,
        )
        .unwrap();
        let mut task = task;
        task.normalize().unwrap();
        assert_eq!(task.cron_expr, "0 0 0 2 * *");
        assert_eq!(task.target_path, "/jobs/nightly");
        assert_eq!(task.exec_type, ExecType::Async);
        assert_eq!(task.status, TaskStatus::Disabled);
        assert_eq!(task.max_concurrency, 1);
        let headers = task.headers().unwrap();
        assert_eq!(headers.get("X-Retry").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_normalize_rejects_bad_headers() {
        let mut task = Task::new("t", "* * * * * *", "svc", "/");
        task.headers_json = "[1,2]".into();
        assert!(task.normalize().is_err());
    }
}
