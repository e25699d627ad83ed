//! Statistics tracking for the DNS transports.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic statistics for tracking resolution outcomes.
pub struct Stats {
    pub requests: AtomicU64,
    pub overridden: AtomicU64,
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
    pub rate_limited: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            overridden: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_overridden(&self, response_time_ms: f64) {
        self.record(&self.overridden, response_time_ms);
    }

    pub fn record_forwarded(&self, response_time_ms: f64) {
        self.record(&self.forwarded, response_time_ms);
    }

    pub fn record_failed(&self, response_time_ms: f64) {
        self.record(&self.failed, response_time_ms);
    }

    /// Denied requests never reach the resolver, so they carry no timing.
    pub fn record_rate_limited(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, counter: &AtomicU64, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let overridden = self.overridden.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let rate_limited = self.rate_limited.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let timed = requests.saturating_sub(rate_limited);
        let avg_response_ms = if timed > 0 {
            (total_us as f64 / timed as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            overridden,
            forwarded,
            failed,
            rate_limited,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StatsSnapshot {
    pub requests: u64,
    pub overridden: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub avg_response_ms: f64,
}
