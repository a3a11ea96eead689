//! # CronClaw Core
//! Shared data model, storage traits, configuration and error types
//! used by every CronClaw crate.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod traits;
pub mod types;

pub use config::CronClawConfig;
pub use error::{CronClawError, Result};
