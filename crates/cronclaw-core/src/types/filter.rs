//! Listing filters for tasks and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::run::RunStatus;
use super::task::TaskStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Substring match on name.
    pub name_like: Option<String>,
    /// Substring match on description.
    pub description_like: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
}

/// Which timestamp a run time-range applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTimeField {
    #[default]
    ScheduledTime,
    StartTime,
    EndTime,
}

impl RunTimeField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::ScheduledTime => "scheduled_time",
            Self::StartTime => "start_time",
            Self::EndTime => "end_time",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    /// Empty means any status.
    pub statuses: Vec<RunStatus>,
    pub time_field: RunTimeField,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn with_statuses(statuses: &[RunStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }
}
