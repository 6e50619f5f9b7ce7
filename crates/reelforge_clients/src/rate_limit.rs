//! Process-wide request gate for the planning database.
//!
//! The planning API enforces a hard 3 requests/second ceiling across the
//! whole process, not per channel. Every outbound planning call acquires a
//! token here first; callers that arrive while the bucket is empty suspend
//! until refill. The waiter count is exported so metrics can see when the
//! budget is the bottleneck.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Hard ceiling for planning-database requests, process-wide.
pub const PLANNING_REQUESTS_PER_SEC: f64 = 3.0;

struct GateState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateGate {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<GateState>,
    waiters: AtomicU64,
    acquired_total: AtomicU64,
    waited_total: AtomicU64,
}

impl RateGate {
    /// Gate for the planning database. Capacity 1 with a 3/s refill keeps
    /// grants at least a third of a second apart, so no one-second window
    /// ever sees more than three requests, even on a cold start.
    pub fn planning() -> Self {
        Self::new(1.0, PLANNING_REQUESTS_PER_SEC)
    }

    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        assert!(capacity >= 1.0 && refill_per_sec > 0.0);
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(GateState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            waiters: AtomicU64::new(0),
            acquired_total: AtomicU64::new(0),
            waited_total: AtomicU64::new(0),
        }
    }

    /// Take one token, suspending until one is available.
    pub async fn acquire(&self) {
        let mut waited = false;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    self.acquired_total.fetch_add(1, Ordering::Relaxed);
                    if waited {
                        self.waited_total.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };

            waited = true;
            self.waiters.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Callers currently suspended on the gate.
    pub fn waiters(&self) -> u64 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Acquisitions that had to wait at least one refill.
    pub fn waited_total(&self) -> u64 {
        self.waited_total.load(Ordering::Relaxed)
    }

    pub fn acquired_total(&self) -> u64 {
        self.acquired_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_within_capacity_is_immediate() {
        let gate = RateGate::new(3.0, 3.0);
        let before = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(Instant::now(), before);
        assert_eq!(gate.waited_total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_request_in_a_second_waits() {
        let gate = RateGate::new(3.0, 3.0);
        let before = Instant::now();
        for _ in 0..4 {
            gate.acquire().await;
        }
        // The fourth token needs ~1/3 s of refill.
        let elapsed = Instant::now().duration_since(before);
        assert!(elapsed >= Duration::from_millis(300), "elapsed: {elapsed:?}");
        assert_eq!(gate.waited_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn planning_gate_never_exceeds_three_per_second() {
        let gate = RateGate::planning();
        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..10 {
            gate.acquire().await;
            stamps.push(Instant::now().duration_since(start));
        }
        // Any four consecutive grants span at least one second, so no
        // one-second window contains more than three requests.
        for window in stamps.windows(4) {
            let span = window[3] - window[0];
            assert!(span >= Duration::from_millis(990), "window span: {span:?}");
        }
    }
}
