//! Progress Tracker: ephemeral per-run progress, never persisted.
//! Lost on restart; the durable run record is unaffected.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Latest progress reported for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub run_id: i64,
    pub current: u64,
    pub total: u64,
    /// 0.0–100.0, two decimals. Zero while `total` is unknown.
    pub percent: f64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ProgressTracker {
    entries: RwLock<HashMap<i64, Progress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress, clamping `current` to `total` when a total is known.
    pub fn set(&self, run_id: i64, current: u64, total: u64, message: &str) -> Progress {
        let current = if total > 0 { current.min(total) } else { current };
        let percent = if total > 0 {
            ((current as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        let progress = Progress {
            run_id,
            current,
            total,
            percent,
            message: message.to_string(),
            updated_at: Utc::now(),
        };
        self.entries.write().insert(run_id, progress.clone());
        progress
    }

    pub fn get(&self, run_id: i64) -> Option<Progress> {
        self.entries.read().get(&run_id).cloned()
    }

    pub fn clear(&self, run_id: i64) -> bool {
        self.entries.write().remove(&run_id).is_some()
    }

    /// Run ids with a progress entry.
    pub fn tracked_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop entries not updated within `ttl`, whatever their run's status.
    pub fn sweep_older_than(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, p| p.updated_at >= cutoff);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clamps_and_computes_percent() {
        let tracker = ProgressTracker::new();
        let p = tracker.set(1, 1, 3, "step 1");
        assert_eq!(p.percent, 33.33);
        let p = tracker.set(1, 10, 4, "overshoot");
        assert_eq!(p.current, 4);
        assert_eq!(p.percent, 100.0);
        let p = tracker.set(2, 7, 0, "unknown total");
        assert_eq!(p.current, 7);
        assert_eq!(p.percent, 0.0);
        assert_eq!(tracker.get(1).unwrap().message, "overshoot");
        assert_eq!(tracker.tracked_ids(), vec![1, 2]);
    }

    #[test]
    fn test_clear() {
        let tracker = ProgressTracker::new();
        tracker.set(5, 1, 2, "");
        assert!(tracker.clear(5));
        assert!(!tracker.clear(5));
        assert!(tracker.get(5).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_ttl_sweep() {
        let tracker = ProgressTracker::new();
        tracker.set(1, 1, 2, "");
        tracker.set(2, 1, 2, "");
        assert_eq!(tracker.sweep_older_than(Duration::minutes(10), Utc::now()), 0);
        let later = Utc::now() + Duration::minutes(11);
        assert_eq!(tracker.sweep_older_than(Duration::minutes(10), later), 2);
        assert!(tracker.is_empty());
    }
}
