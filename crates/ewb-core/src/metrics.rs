//! Global atomic counters for batch observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a batch.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free atomic counters.
pub struct Metrics {
    cases_dispatched: AtomicU64,
    fallback_dispatches: AtomicU64,
    sources_opened: AtomicU64,
    checkpoints_written: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cases_dispatched: AtomicU64::new(0),
            fallback_dispatches: AtomicU64::new(0),
            sources_opened: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
        }
    }

    /// Count `n` cases handed to the worker pool.
    pub fn add_cases_dispatched(&self, n: u64) {
        self.cases_dispatched.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "cases_dispatched", n, "counter incremented");
    }

    /// Count `n` cases re-dispatched against a fallback source.
    pub fn add_fallback_dispatches(&self, n: u64) {
        self.fallback_dispatches.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "fallback_dispatches", n, "counter incremented");
    }

    pub fn inc_sources_opened(&self) {
        self.sources_opened.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sources_opened", "counter incremented");
    }

    pub fn inc_checkpoints_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "checkpoints_written", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cases_dispatched = self.cases_dispatched(),
            fallback_dispatches = self.fallback_dispatches(),
            sources_opened = self.sources_opened(),
            checkpoints_written = self.checkpoints_written(),
        );
    }

    pub fn cases_dispatched(&self) -> u64 {
        self.cases_dispatched.load(Ordering::Relaxed)
    }

    pub fn fallback_dispatches(&self) -> u64 {
        self.fallback_dispatches.load(Ordering::Relaxed)
    }

    pub fn sources_opened(&self) -> u64 {
        self.sources_opened.load(Ordering::Relaxed)
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cases_dispatched.store(0, Ordering::Relaxed);
        self.fallback_dispatches.store(0, Ordering::Relaxed);
        self.sources_opened.store(0, Ordering::Relaxed);
        self.checkpoints_written.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.cases_dispatched(), 0);
        m.add_cases_dispatched(10);
        m.add_cases_dispatched(2);
        assert_eq!(m.cases_dispatched(), 12);

        m.add_fallback_dispatches(3);
        assert_eq!(m.fallback_dispatches(), 3);

        m.inc_sources_opened();
        m.inc_checkpoints_written();
        m.inc_checkpoints_written();
        assert_eq!(m.sources_opened(), 1);
        assert_eq!(m.checkpoints_written(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.add_cases_dispatched(4);
        m.add_fallback_dispatches(1);
        m.inc_sources_opened();
        m.inc_checkpoints_written();
        m.reset();
        assert_eq!(m.cases_dispatched(), 0);
        assert_eq!(m.fallback_dispatches(), 0);
        assert_eq!(m.sources_opened(), 0);
        assert_eq!(m.checkpoints_written(), 0);
    }
}
