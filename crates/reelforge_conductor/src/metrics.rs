//! In-memory metrics for conductor observability.
//!
//! Lock-free atomics, single global instance; snapshots are embedded in the
//! `/health` response.

use reelforge_protocol::http_types::CounterSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub tasks_claimed: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_rejected: AtomicU64,
    pub leases_resurrected: AtomicU64,
    pub mirror_posts: AtomicU64,
    pub mirror_failures: AtomicU64,
    pub inbound_observations: AtomicU64,
    pub stages_completed: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_claimed: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            leases_resurrected: AtomicU64::new(0),
            mirror_posts: AtomicU64::new(0),
            mirror_failures: AtomicU64::new(0),
            inbound_observations: AtomicU64::new(0),
            stages_completed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, rate_gate_waits: u64) -> CounterSnapshot {
        CounterSnapshot {
            tasks_claimed: self.tasks_claimed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            leases_resurrected: self.leases_resurrected.load(Ordering::Relaxed),
            mirror_posts: self.mirror_posts.load(Ordering::Relaxed),
            mirror_failures: self.mirror_failures.load(Ordering::Relaxed),
            rate_gate_waits,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
