//! Process-wide lifecycle counters.
//!
//! Incremented silently at the call site; [`Metrics::flush`] emits the
//! current values as one `info!` event (the daemon does so every tick).

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    installs: AtomicU64,
    promotions: AtomicU64,
    rollbacks: AtomicU64,
    health_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            installs: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            health_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_installs(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "installs", "counter incremented");
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "promotions", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn inc_health_failures(&self) {
        self.health_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "health_failures", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            installs = self.installs(),
            promotions = self.promotions(),
            rollbacks = self.rollbacks(),
            health_failures = self.health_failures(),
        );
    }

    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn health_failures(&self) -> u64 {
        self.health_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.installs.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.health_failures.store(0, Ordering::Relaxed);
    }
}
