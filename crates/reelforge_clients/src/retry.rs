//! Shared retry loop with full-jitter exponential backoff.
//!
//! This is the *client-level* retry (3 attempts, 1 s doubling to a 60 s
//! cap) for transient HTTP failures. The pipeline-level retry schedule
//! (1/5/15/60 minutes across task attempts) lives in the engine.

use crate::error::ClientError;
use rand::Rng;
use reelforge_protocol::Retriability;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum attempts per logical request.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Full-jitter delay before attempt `attempt` (1-based; attempt 1 has no
/// delay). The deterministic envelope doubles from 1 s and caps at 60 s;
/// the actual delay is uniform in [0, envelope].
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(2).min(16);
    let envelope = BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(MAX_DELAY);
    let jittered = rand::thread_rng().gen_range(0.0..=1.0) * envelope.as_secs_f64();
    Duration::from_secs_f64(jittered)
}

/// Run `op` up to `MAX_ATTEMPTS` times, sleeping a jittered backoff between
/// retriable failures. Terminal failures return immediately.
pub async fn retry_request<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retriable = err.retriability() == Retriability::Retriable;
                if !retriable || attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
                attempt += 1;
                let delay = backoff_delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
