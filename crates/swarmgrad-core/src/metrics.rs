//! Global atomic counters for round-level observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `info!` event,
//! e.g. once per window.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    windows_processed: AtomicU64,
    rounds_deferred: AtomicU64,
    peers_skipped: AtomicU64,
    artifacts_published: AtomicU64,
    catchup_steps: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            windows_processed: AtomicU64::new(0),
            rounds_deferred: AtomicU64::new(0),
            peers_skipped: AtomicU64::new(0),
            artifacts_published: AtomicU64::new(0),
            catchup_steps: AtomicU64::new(0),
        }
    }

    pub fn inc_windows_processed(&self) {
        self.windows_processed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "windows_processed", "counter incremented");
    }

    /// A round ended with zero contributors.
    pub fn inc_rounds_deferred(&self) {
        self.rounds_deferred.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rounds_deferred", "counter incremented");
    }

    pub fn inc_peers_skipped(&self) {
        self.peers_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "peers_skipped", "counter incremented");
    }

    pub fn inc_artifacts_published(&self) {
        self.artifacts_published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "artifacts_published", "counter incremented");
    }

    pub fn inc_catchup_steps(&self) {
        self.catchup_steps.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "catchup_steps", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            windows_processed = self.windows_processed(),
            rounds_deferred = self.rounds_deferred(),
            peers_skipped = self.peers_skipped(),
            artifacts_published = self.artifacts_published(),
            catchup_steps = self.catchup_steps(),
        );
    }

    pub fn windows_processed(&self) -> u64 {
        self.windows_processed.load(Ordering::Relaxed)
    }

    pub fn rounds_deferred(&self) -> u64 {
        self.rounds_deferred.load(Ordering::Relaxed)
    }

    pub fn peers_skipped(&self) -> u64 {
        self.peers_skipped.load(Ordering::Relaxed)
    }

    pub fn artifacts_published(&self) -> u64 {
        self.artifacts_published.load(Ordering::Relaxed)
    }

    pub fn catchup_steps(&self) -> u64 {
        self.catchup_steps.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.windows_processed.store(0, Ordering::Relaxed);
        self.rounds_deferred.store(0, Ordering::Relaxed);
        self.peers_skipped.store(0, Ordering::Relaxed);
        self.artifacts_published.store(0, Ordering::Relaxed);
        self.catchup_steps.store(0, Ordering::Relaxed);
    }
}
