use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Coordination counters shared by every component of one coordinator.
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    pub edits_applied: AtomicU64,
    pub edits_rejected: AtomicU64,
    pub lock_acquisitions: AtomicU64,
    pub lock_contentions: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub lock_reclamations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub external_changes: AtomicU64,
    pub events_published: AtomicU64,
    pub events_merged: AtomicU64,
    pub events_dropped: AtomicU64,
    pub phase_transitions: AtomicU64,
    pub io_retries: AtomicU64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_edit_applied(&self) {
        self.edits_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_edit_rejected(&self) {
        self.edits_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_acquired(&self, contended: bool) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.lock_contentions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_reclaimed(&self) {
        self.lock_reclamations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_external_change(&self) {
        self.external_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_merged(&self) {
        self.events_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_phase_transition(&self) {
        self.phase_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_retry(&self) {
        self.io_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            edits_applied: self.edits_applied.load(Ordering::Relaxed),
            edits_rejected: self.edits_rejected.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            lock_reclamations: self.lock_reclamations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            external_changes: self.external_changes.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_merged: self.events_merged.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            phase_transitions: self.phase_transitions.load(Ordering::Relaxed),
            io_retries: self.io_retries.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            "Coordination metrics: edits applied={} rejected={}, locks={} (contended={}, timeouts={}, reclaimed={}), cache hits={} misses={}, events={} merged={} dropped={}, phase transitions={}",
            stats.edits_applied,
            stats.edits_rejected,
            stats.lock_acquisitions,
            stats.lock_contentions,
            stats.lock_timeouts,
            stats.lock_reclamations,
            stats.cache_hits,
            stats.cache_misses,
            stats.events_published,
            stats.events_merged,
            stats.events_dropped,
            stats.phase_transitions
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub edits_applied: u64,
    pub edits_rejected: u64,
    pub lock_acquisitions: u64,
    pub lock_contentions: u64,
    pub lock_timeouts: u64,
    pub lock_reclamations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub external_changes: u64,
    pub events_published: u64,
    pub events_merged: u64,
    pub events_dropped: u64,
    pub phase_transitions: u64,
    pub io_retries: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = CoordinationMetrics::new();
        metrics.record_edit_applied();
        metrics.record_edit_applied();
        metrics.record_edit_rejected();
        metrics.record_lock_acquired(true);
        metrics.record_lock_acquired(false);
        metrics.record_events_dropped(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.edits_applied, 2);
        assert_eq!(snapshot.edits_rejected, 1);
        assert_eq!(snapshot.lock_acquisitions, 2);
        assert_eq!(snapshot.lock_contentions, 1);
        assert_eq!(snapshot.events_dropped, 3);
        assert_eq!(snapshot.phase_transitions, 0);
    }
}
