//! Storage traits implemented by persistence backends.

pub mod store;

pub use store::{RunStore, TaskStore};
