//! Engine counters
//!
//! [`EngineMetrics`] is created once per process and handed to the executor
//! and relay at construction. Exporting the numbers is left to the embedding
//! service; [`EngineMetrics::snapshot`] gives a consistent-enough read.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

/// Counters recorded by the engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    instances_completed: AtomicU64,
    steps_executed: AtomicU64,
    step_retries: AtomicU64,
    dead_letters: AtomicU64,
    step_duration_ms_total: AtomicU64,
    outbox_published: AtomicU64,
    outbox_failed: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub instances_completed: u64,
    pub steps_executed: u64,
    pub step_retries: u64,
    pub dead_letters: u64,
    pub step_duration_ms_total: u64,
    pub outbox_published: u64,
    pub outbox_failed: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&self) {
        self.instances_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished step attempt and its duration
    pub fn record_step(&self, step_id: &str, duration_ms: i64) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.step_duration_ms_total
            .fetch_add(duration_ms.max(0) as u64, Ordering::Relaxed);
        trace!(step_id, duration_ms, "step duration recorded");
    }

    pub fn record_outbox_published(&self) {
        self.outbox_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outbox_failed(&self) {
        self.outbox_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instances_completed: self.instances_completed.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            step_duration_ms_total: self.step_duration_ms_total.load(Ordering::Relaxed),
            outbox_published: self.outbox_published.load(Ordering::Relaxed),
            outbox_failed: self.outbox_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let metrics = EngineMetrics::new();
        metrics.record_completed();
        metrics.record_retry();
        metrics.record_retry();
        metrics.record_step("fetch", 40);
        metrics.record_step("fetch", -5);

        let snap = metrics.snapshot();
        assert_eq!(snap.instances_completed, 1);
        assert_eq!(snap.step_retries, 2);
        assert_eq!(snap.steps_executed, 2);
        assert_eq!(snap.step_duration_ms_total, 40);
        assert_eq!(snap.dead_letters, 0);
    }
}
