//! Statistics tracking for the DNS proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// How a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Answered from the override table.
    Overridden,
    /// Answered from the persistent cache.
    Cached,
    /// Answered with the loopback address without tunneling.
    Loopback,
    /// Answered after a successful tunnel lookup.
    Resolved,
    /// Tunnel lookup failed, nothing was sent.
    Failed,
    /// Dropped because the same domain was already being resolved.
    Duplicate,
    /// Dropped because the question could not be parsed.
    Malformed,
}

/// Atomic statistics for tracking proxy performance.
pub struct Stats {
    started: Instant,
    pub requests: AtomicU64,
    pub overridden: AtomicU64,
    pub cached: AtomicU64,
    pub loopback: AtomicU64,
    pub resolved: AtomicU64,
    pub failed: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    /// Cumulative handling time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            overridden: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            loopback: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: Outcome, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Overridden => &self.overridden,
            Outcome::Cached => &self.cached,
            Outcome::Loopback => &self.loopback,
            Outcome::Resolved => &self.resolved,
            Outcome::Failed => &self.failed,
            Outcome::Duplicate => &self.duplicates,
            Outcome::Malformed => &self.malformed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            overridden: self.overridden.swap(0, Ordering::Relaxed),
            cached: self.cached.swap(0, Ordering::Relaxed),
            loopback: self.loopback.swap(0, Ordering::Relaxed),
            resolved: self.resolved.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            duplicates: self.duplicates.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub overridden: u64,
    pub cached: u64,
    pub loopback: u64,
    pub resolved: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub avg_response_ms: f64,
}
