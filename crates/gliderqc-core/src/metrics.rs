//! Process-wide atomic counters for QC runs.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits their
//! current values as one `tracing::info!` event at the end of a batch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    datasets_processed: AtomicU64,
    datasets_failed: AtomicU64,
    profiles_failed: AtomicU64,
    duplicates_removed: AtomicU64,
    flags_written: AtomicU64,
    archivals_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            datasets_processed: AtomicU64::new(0),
            datasets_failed: AtomicU64::new(0),
            profiles_failed: AtomicU64::new(0),
            duplicates_removed: AtomicU64::new(0),
            flags_written: AtomicU64::new(0),
            archivals_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_datasets_processed(&self) {
        self.datasets_processed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "datasets_processed", "counter incremented");
    }

    pub fn inc_datasets_failed(&self) {
        self.datasets_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "datasets_failed", "counter incremented");
    }

    pub fn inc_profiles_failed(&self) {
        self.profiles_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "profiles_failed", "counter incremented");
    }

    pub fn add_duplicates_removed(&self, n: u64) {
        self.duplicates_removed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_flags_written(&self, n: u64) {
        self.flags_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_archivals_failed(&self) {
        self.archivals_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "archivals_failed", "counter incremented");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            datasets_processed = self.datasets_processed(),
            datasets_failed = self.datasets_failed(),
            profiles_failed = self.profiles_failed(),
            duplicates_removed = self.duplicates_removed(),
            flags_written = self.flags_written(),
            archivals_failed = self.archivals_failed(),
        );
    }

    pub fn datasets_processed(&self) -> u64 {
        self.datasets_processed.load(Ordering::Relaxed)
    }

    pub fn datasets_failed(&self) -> u64 {
        self.datasets_failed.load(Ordering::Relaxed)
    }

    pub fn profiles_failed(&self) -> u64 {
        self.profiles_failed.load(Ordering::Relaxed)
    }

    pub fn duplicates_removed(&self) -> u64 {
        self.duplicates_removed.load(Ordering::Relaxed)
    }

    pub fn flags_written(&self) -> u64 {
        self.flags_written.load(Ordering::Relaxed)
    }

    pub fn archivals_failed(&self) -> u64 {
        self.archivals_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.datasets_processed.store(0, Ordering::Relaxed);
        self.datasets_failed.store(0, Ordering::Relaxed);
        self.profiles_failed.store(0, Ordering::Relaxed);
        self.duplicates_removed.store(0, Ordering::Relaxed);
        self.flags_written.store(0, Ordering::Relaxed);
        self.archivals_failed.store(0, Ordering::Relaxed);
    }
}
