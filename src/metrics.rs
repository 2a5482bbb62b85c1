//! Pipeline counters
//!
//! Raw atomic counters for the relay pipeline. Exporting and formatting are
//! someone else's job; these are the numbers lifecycle logs and health
//! endpoints read from.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared across one supervisor's pipelines.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    events_skipped: AtomicU64,
    batches_committed: AtomicU64,
    lease_acquisitions: AtomicU64,
    lease_losses: AtomicU64,
    engine_restarts: AtomicU64,
    offset_resets: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An event deliberately not sent (feature gate off) but still marked
    /// processed.
    pub fn record_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_committed(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_acquired(&self) {
        self.lease_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_lost(&self) {
        self.lease_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_restart(&self) {
        self.engine_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offset_reset(&self) {
        self.offset_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time view of all counters.
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            lease_acquisitions: self.lease_acquisitions.load(Ordering::Relaxed),
            lease_losses: self.lease_losses.load(Ordering::Relaxed),
            engine_restarts: self.engine_restarts.load(Ordering::Relaxed),
            offset_resets: self.offset_resets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub events_published: u64,
    pub publish_failures: u64,
    pub events_skipped: u64,
    pub batches_committed: u64,
    pub lease_acquisitions: u64,
    pub lease_losses: u64,
    pub engine_restarts: u64,
    pub offset_resets: u64,
}
