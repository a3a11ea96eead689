//! Component lifecycle: explicit start/stop/health per component.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Health reported by a component. Reporting never aborts the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Inactive,
    Degraded(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Implemented by every long-lived component. `start` and `stop` are idempotent.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn health(&self) -> Health;
}
