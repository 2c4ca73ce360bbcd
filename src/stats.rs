//! Relay counters.
//!
//! Updated from the capture and processing threads with relaxed atomics;
//! read as a `StatsSnapshot` for health logs and the shutdown summary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct RelayStats {
    captured: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    skipped_no_receiver: AtomicU64,
    conversion_failures: AtomicU64,
    abandoned: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of `RelayStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub skipped_no_receiver: u64,
    pub conversion_failures: u64,
    /// In-flight frames left unreleased at shutdown.
    pub abandoned: u64,
    pub last_error: Option<String>,
}

impl StatsSnapshot {
    /// Frames that left the capture loop one way or another.
    pub fn accounted(&self) -> u64 {
        self.dispatched + self.dropped + self.skipped_no_receiver + self.conversion_failures
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped_no_receiver.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_conversion_failure(&self, err: &dyn std::fmt::Display) {
        self.conversion_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(err);
    }

    pub fn set_last_error(&self, err: &dyn std::fmt::Display) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(err.to_string());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped_no_receiver: self.skipped_no_receiver.load(Ordering::Relaxed),
            conversion_failures: self.conversion_failures.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RelayStats::new();
        for _ in 0..4 {
            stats.record_captured();
        }
        stats.record_dispatched();
        stats.record_dropped(2);
        stats.record_conversion_failure(&"frame too short");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.captured, 4);
        assert_eq!(snapshot.accounted(), 4);
        assert_eq!(snapshot.last_error.as_deref(), Some("frame too short"));
    }

    #[test]
    fn snapshot_serializes_as_flat_json() {
        let stats = RelayStats::new();
        stats.record_skipped();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["skipped_no_receiver"], 1);
        assert!(json["last_error"].is_null());
    }
}
