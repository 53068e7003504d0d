//! Pool counters
//!
//! Lifetime counters updated with relaxed atomics and read as a coherent
//! snapshot. These are pool state, not a metrics-reporting sink.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time snapshot of pool activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Connections opened over the pool's lifetime
    pub connections_opened: u64,
    /// Connections closed (including aborted) over the pool's lifetime
    pub connections_closed: u64,
    /// Successful borrows
    pub borrows: u64,
    /// Borrows that exhausted their time budget
    pub borrow_timeouts: u64,
    /// Liveness probes that reported a dead connection
    pub validation_failures: u64,
    /// Sum of successful borrow wait times, in microseconds
    pub total_borrow_wait_micros: u64,
}

/// Atomic counters for concurrent updates
#[derive(Debug, Default)]
pub struct AtomicPoolMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    borrows: AtomicU64,
    borrow_timeouts: AtomicU64,
    validation_failures: AtomicU64,
    total_borrow_wait_micros: AtomicU64,
}

impl AtomicPoolMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection open
    pub fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close or abort
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful borrow and its wait time
    pub fn record_borrow(&self, wait_micros: u64) {
        self.borrows.fetch_add(1, Ordering::Relaxed);
        self.total_borrow_wait_micros
            .fetch_add(wait_micros, Ordering::Relaxed);
    }

    /// Record a borrow timeout
    pub fn record_timeout(&self) {
        self.borrow_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed liveness probe
    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current counters
    pub fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            borrows: self.borrows.load(Ordering::Relaxed),
            borrow_timeouts: self.borrow_timeouts.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            total_borrow_wait_micros: self.total_borrow_wait_micros.load(Ordering::Relaxed),
        }
    }

    /// Average successful borrow wait in milliseconds
    pub fn avg_borrow_wait_ms(&self) -> f64 {
        let borrows = self.borrows.load(Ordering::Relaxed);
        if borrows == 0 {
            0.0
        } else {
            let micros = self.total_borrow_wait_micros.load(Ordering::Relaxed);
            micros as f64 / borrows as f64 / 1000.0
        }
    }
}
