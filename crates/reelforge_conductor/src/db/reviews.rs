//! Review rows: one decisive decision per (task, gate, attempt).

use super::models::ReviewRow;
use super::now_rfc3339;
use anyhow::{Context, Result};
use reelforge_db::DbPool;
use reelforge_protocol::{ReviewDecision, ReviewGate};
use uuid::Uuid;

/// Error returned when a gate already has its decisive review (or the task
/// left the gate).
#[derive(Debug, thiserror::Error)]
#[error("gate {gate} for task {task_id} attempt {attempt} is closed")]
pub struct GateClosed {
    pub task_id: String,
    pub gate: ReviewGate,
    pub attempt: i64,
}

/// Record the decisive review for an open gate. The unique index on
/// (task, gate, attempt) enforces at-most-one; a second decision surfaces
/// `GateClosed`.
pub async fn record_decision(
    pool: &DbPool,
    task_id: &str,
    gate: ReviewGate,
    attempt: i64,
    reviewer: &str,
    decision: ReviewDecision,
    note: Option<&str>,
) -> Result<ReviewRow> {
    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        r#"INSERT INTO reviews (id, task_id, gate, attempt, reviewer, decision, note, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(task_id)
    .bind(gate.as_db_str())
    .bind(attempt)
    .bind(reviewer)
    .bind(decision.as_db_str())
    .bind(note)
    .bind(now_rfc3339())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(GateClosed {
                task_id: task_id.to_string(),
                gate,
                attempt,
            }
            .into());
        }
        Err(err) => return Err(err).context("insert review"),
    }

    let row = sqlx::query_as::<_, ReviewRow>("SELECT * FROM reviews WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn reviews_for_task(pool: &DbPool, task_id: &str) -> Result<Vec<ReviewRow>> {
    let rows = sqlx::query_as::<_, ReviewRow>(
        "SELECT * FROM reviews WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The latest rejection for a task, if any; the manual-retry path uses its
/// gate and note to decide which files to regenerate.
pub async fn latest_rejection(pool: &DbPool, task_id: &str) -> Result<Option<ReviewRow>> {
    let row = sqlx::query_as::<_, ReviewRow>(
        r#"SELECT * FROM reviews WHERE task_id = ? AND decision = 'rejected'
           ORDER BY created_at DESC LIMIT 1"#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
