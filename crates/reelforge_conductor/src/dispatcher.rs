//! Worker loops and the lease sweeper.
//!
//! Multiple lightweight workers per process share the claim primitive; the
//! sweeper returns expired leases to the queue and watches for the
//! infrastructure conditions that warrant a critical alert.

use crate::context::AppContext;
use crate::db::{queue, tasks};
use crate::engine;
use crate::metrics::METRICS;
use rand::Rng;
use reelforge_protocol::{AlertSeverity, StatusLabel};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive idle-with-backlog sweeps before the critical alert.
const STALL_SWEEPS: u32 = 3;

/// Upper bound on idle backoff jitter.
const MAX_IDLE_JITTER: Duration = Duration::from_secs(5);

/// One worker: claim, run, repeat. Exits on shutdown.
pub async fn run_worker(ctx: &AppContext, worker_id: String) {
    info!(worker = %worker_id, "worker started");
    loop {
        if ctx.is_shutting_down() {
            info!(worker = %worker_id, "worker stopping");
            return;
        }
        ctx.heartbeat(&worker_id, false);

        let blocked = ctx.registry.upload_blocked();
        let claimed = match queue::claim_next(&ctx.pool, &worker_id, &blocked).await {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(worker = %worker_id, error = %err, "claim failed");
                None
            }
        };

        match claimed {
            Some(task) => {
                METRICS.inc(&METRICS.tasks_claimed);
                ctx.heartbeat(&worker_id, true);
                ctx.registry.acquire_slot(&task.channel_id);
                engine::mirror(ctx, &task, StatusLabel::Claimed, None);

                let channel_id = task.channel_id.clone();
                let task_id = task.id.clone();
                if let Err(err) = engine::run_claimed_task(ctx, task).await {
                    error!(worker = %worker_id, task = %task_id, error = %err, "task run errored");
                }
                ctx.registry.release_slot(&channel_id);
            }
            None => {
                idle_wait(ctx).await;
            }
        }
    }
}

/// No claimable work: wait for a nudge or a jittered poll interval.
async fn idle_wait(ctx: &AppContext) {
    let jitter = Duration::from_millis(
        rand::thread_rng().gen_range(0..MAX_IDLE_JITTER.as_millis() as u64),
    );
    tokio::select! {
        _ = ctx.wake.notified() => {}
        _ = tokio::time::sleep(ctx.poll_interval + jitter) => {}
    }
}

/// Retries per sweep interval that count as an elevated retry rate.
const RETRY_RATE_WARN: u64 = 10;

/// Lease sweeper plus infrastructure watchdog.
pub async fn run_sweeper(ctx: &AppContext) {
    let mut db_was_down = false;
    let mut stalled_sweeps = 0u32;
    let mut last_retried = METRICS
        .tasks_retried
        .load(std::sync::atomic::Ordering::Relaxed);

    loop {
        if ctx.is_shutting_down() {
            return;
        }
        tokio::time::sleep(SWEEP_INTERVAL).await;

        // Database reachability transitions drive the critical alert.
        let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&ctx.pool)
            .await
            .is_ok();
        if !db_ok {
            if !db_was_down {
                ctx.alert(
                    AlertSeverity::Critical,
                    "database unreachable",
                    json!({}),
                )
                .await;
            }
            db_was_down = true;
            continue;
        }
        if db_was_down {
            info!("database reachable again");
            db_was_down = false;
        }

        match queue::sweep_expired_leases(&ctx.pool).await {
            Ok(0) => {}
            Ok(resurrected) => {
                METRICS.add(&METRICS.leases_resurrected, resurrected);
                ctx.wake.notify_waiters();
            }
            Err(err) => warn!(error = %err, "lease sweep failed"),
        }

        // A burst of retries inside one sweep interval is worth a warning.
        let retried = METRICS
            .tasks_retried
            .load(std::sync::atomic::Ordering::Relaxed);
        if retried.saturating_sub(last_retried) >= RETRY_RATE_WARN {
            ctx.alert(
                AlertSeverity::Warning,
                "elevated retry rate",
                json!({"retries_in_interval": retried - last_retried}),
            )
            .await;
        }
        last_retried = retried;

        // Backlog growing while every worker idles is a scheduler stall.
        let depth = tasks::queue_depth(&ctx.pool).await.unwrap_or(0);
        let in_flight = tasks::in_flight_total(&ctx.pool).await.unwrap_or(0);
        if depth > 0 && in_flight == 0 {
            stalled_sweeps += 1;
            if stalled_sweeps == STALL_SWEEPS {
                ctx.alert(
                    AlertSeverity::Critical,
                    "backlog growing while all workers idle",
                    json!({"queue_depth": depth}),
                )
                .await;
            }
        } else {
            stalled_sweeps = 0;
        }
    }
}
