//! Atomic claim and lease management.
//!
//! The claim primitive is lock-and-skip on SQLite: pick a candidate, then
//! `UPDATE ... WHERE id = ? AND state IN (...)` and check `rows_affected`.
//! A concurrent claimer loses the guard and simply polls again; no two
//! workers can ever hold the same row.

use super::models::TaskRow;
use super::now_rfc3339;
use crate::db::channels::touch_last_served;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use reelforge_clients::UPLOAD_COST_UNITS;
use reelforge_db::{with_tx, DbError, DbPool};
use reelforge_protocol::Stage;
use std::collections::HashSet;
use tracing::{debug, info};

/// Default worker lease on a claimed task.
pub const LEASE_DEFAULT_MINUTES: i64 = 30;

/// Upload-stage lease: twice the upload subprocess timeout.
pub const LEASE_UPLOAD_MINUTES: i64 = 40;

#[derive(Debug, sqlx::FromRow)]
struct ChannelCandidate {
    channel_id: String,
    priority_weight: i64,
    last_served_at: Option<String>,
    max_concurrent: i64,
    in_flight: i64,
}

/// Claim the next task for `worker_id`, honoring per-channel capacity,
/// weighted round-robin fairness and the upload-stage gates. Returns `None`
/// when no eligible work exists (or a concurrent worker won the race).
pub async fn claim_next(
    pool: &DbPool,
    worker_id: &str,
    upload_blocked_channels: &HashSet<String>,
) -> Result<Option<TaskRow>> {
    let blocked = upload_blocked_channels.clone();
    let worker = worker_id.to_string();

    with_tx::<_, anyhow::Error, _>(pool, move |conn| {
        Box::pin(async move {
            let now = now_rfc3339();

            let channels: Vec<ChannelCandidate> = sqlx::query_as(
                r#"SELECT c.channel_id, c.priority_weight, c.last_served_at, c.max_concurrent,
                          (SELECT COUNT(*) FROM tasks t
                           WHERE t.channel_id = c.channel_id
                             AND t.state IN ('claimed', 'processing')) AS in_flight
                   FROM channels c
                   WHERE c.is_active = 1"#,
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(DbError::from)?;

            let mut best: Option<(TaskRow, f64)> = None;
            for channel in &channels {
                if channel.in_flight >= channel.max_concurrent {
                    continue;
                }

                let candidate = best_candidate_for_channel(
                    conn,
                    &channel.channel_id,
                    &now,
                    blocked.contains(&channel.channel_id),
                )
                .await?;
                let Some(candidate) = candidate else {
                    continue;
                };

                let score = staleness_score(channel);
                let replace = match &best {
                    None => true,
                    Some((current, current_score)) => {
                        candidate.priority > current.priority
                            || (candidate.priority == current.priority && score > *current_score)
                            || (candidate.priority == current.priority
                                && score == *current_score
                                && candidate.created_at < current.created_at)
                    }
                };
                if replace {
                    best = Some((candidate, score));
                }
            }

            let Some((task, _)) = best else {
                return Ok(None);
            };

            let lease_minutes = if task.stage_index == Stage::Upload.index() as i64 {
                LEASE_UPLOAD_MINUTES
            } else {
                LEASE_DEFAULT_MINUTES
            };
            let lease_expires = (Utc::now() + ChronoDuration::minutes(lease_minutes)).to_rfc3339();

            // The lock-and-skip guard: only an unclaimed row transitions.
            let claimed = sqlx::query(
                r#"UPDATE tasks SET state = 'claimed', claimed_by = ?, claimed_at = ?,
                       lease_expires_at = ?, updated_at = ?
                   WHERE id = ? AND state IN ('pending', 'retry', 'approved')"#,
            )
            .bind(&worker)
            .bind(&now)
            .bind(&lease_expires)
            .bind(&now)
            .bind(&task.id)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from)?
            .rows_affected();

            if claimed == 0 {
                debug!(task = %task.id, "lost claim race");
                return Ok(None);
            }

            touch_last_served(conn, &task.channel_id)
                .await
                .map_err(DbError::from)?;

            let row: TaskRow = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
                .bind(&task.id)
                .fetch_one(&mut *conn)
                .await
                .map_err(DbError::from)?;

            info!(task = %row.id, channel = %row.channel_id, stage = row.stage_index, worker = %worker, "claimed task");
            Ok(Some(row))
        })
    })
    .await
}

/// Best claimable task for one channel: priority first, FIFO within. Upload
/// stage tasks are skipped when the channel's upload path is blocked, and
/// pre-checked against today's quota ledger.
async fn best_candidate_for_channel(
    conn: &mut sqlx::SqliteConnection,
    channel_id: &str,
    now: &str,
    upload_blocked: bool,
) -> Result<Option<TaskRow>> {
    let exclude_upload = if upload_blocked {
        true
    } else {
        !upload_quota_available(conn, channel_id).await?
    };

    let sql = if exclude_upload {
        r#"SELECT * FROM tasks
           WHERE channel_id = ? AND state IN ('pending', 'retry', 'approved')
             AND available_at <= ? AND stage_index != 6
           ORDER BY priority DESC, created_at ASC LIMIT 1"#
    } else {
        r#"SELECT * FROM tasks
           WHERE channel_id = ? AND state IN ('pending', 'retry', 'approved')
             AND available_at <= ?
           ORDER BY priority DESC, created_at ASC LIMIT 1"#
    };

    let row = sqlx::query_as::<_, TaskRow>(sql)
        .bind(channel_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::from)?;
    Ok(row)
}

/// Soft pre-check: would one upload fit in today's ledger?
async fn upload_quota_available(
    conn: &mut sqlx::SqliteConnection,
    channel_id: &str,
) -> Result<bool> {
    let today = super::today_utc();
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT units_used, daily_ceiling FROM upload_quota_ledger WHERE channel_id = ? AND date = ?",
    )
    .bind(channel_id)
    .bind(&today)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::from)?;

    Ok(match row {
        Some((used, ceiling)) => used + UPLOAD_COST_UNITS <= ceiling,
        None => true,
    })
}

/// Weighted staleness: seconds since the channel was last served, scaled by
/// its priority weight. Never-served channels sort first.
fn staleness_score(channel: &ChannelCandidate) -> f64 {
    match &channel.last_served_at {
        None => f64::INFINITY,
        Some(stamp) => {
            let served = super::parse_ts(stamp);
            let idle = (Utc::now() - served).num_milliseconds().max(0) as f64 / 1000.0;
            idle * channel.priority_weight.max(1) as f64
        }
    }
}

/// Return expired leases to the queue. The stage bitmap survives, so the
/// next claimer resumes instead of restarting.
pub async fn sweep_expired_leases(pool: &DbPool) -> Result<u64> {
    let now = now_rfc3339();
    let result = sqlx::query(
        r#"UPDATE tasks SET state = 'pending',
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE state IN ('claimed', 'processing') AND lease_expires_at < ?"#,
    )
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    let resurrected = result.rows_affected();
    if resurrected > 0 {
        info!(resurrected, "returned expired leases to the queue");
    }
    Ok(resurrected)
}
