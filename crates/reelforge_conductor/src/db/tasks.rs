//! Task rows: enqueue and lifecycle transitions.
//!
//! Every transition is a single short statement (or runs on a transaction
//! handle supplied by the engine's stage-end transaction). Lease fields are
//! cleared on any transition that parks the task.

use super::models::TaskRow;
use super::now_rfc3339;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reelforge_db::DbPool;
use reelforge_protocol::{set_stage, ErrorLog, Priority, Stage, TaskId, TaskState};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewTask {
    pub channel_id: String,
    pub planning_page_ref: String,
    pub title: String,
    pub topic: String,
    pub story_direction: String,
    pub priority: Priority,
}

/// Idempotent enqueue: one live task per (channel, page). A second call
/// while the first is non-terminal returns the existing row.
pub async fn enqueue(pool: &DbPool, new: &NewTask) -> Result<TaskRow> {
    if let Some(existing) = live_task_for_page(pool, &new.channel_id, &new.planning_page_ref).await?
    {
        return Ok(existing);
    }

    let id = TaskId::new();
    let now = now_rfc3339();
    let inserted = sqlx::query(
        r#"INSERT INTO tasks (
               id, channel_id, planning_page_ref, title, topic, story_direction,
               priority, state, stage_index, completed_stages, retry_count, attempt,
               available_at, correlation_id, created_at, updated_at
           ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, 0, 0, 1, ?, ?, ?, ?)"#,
    )
    .bind(id.as_str())
    .bind(&new.channel_id)
    .bind(&new.planning_page_ref)
    .bind(&new.title)
    .bind(&new.topic)
    .bind(&new.story_direction)
    .bind(new.priority.as_i64())
    .bind(&now)
    .bind(Uuid::new_v4().to_string())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            // Lost a race with a concurrent enqueue for the same page.
            if let Some(existing) =
                live_task_for_page(pool, &new.channel_id, &new.planning_page_ref).await?
            {
                return Ok(existing);
            }
            return Err(anyhow::anyhow!(
                "enqueue raced but no live task found for page {}",
                new.planning_page_ref
            ));
        }
        Err(err) => return Err(err).context("insert task"),
    }

    get_task(pool, id.as_str())
        .await?
        .context("task vanished after insert")
}

/// Re-enqueue an errored page as a fresh attempt, resuming from the first
/// incomplete stage. The prior (terminal) row is preserved for audit.
pub async fn enqueue_retry_attempt(pool: &DbPool, prior: &TaskRow) -> Result<TaskRow> {
    let id = TaskId::new();
    let now = now_rfc3339();
    let resume_stage = reelforge_protocol::task::first_incomplete_stage(prior.bitmap())
        .map(|s| s.index() as i64)
        .unwrap_or(Stage::Finalize.index() as i64);

    sqlx::query(
        r#"INSERT INTO tasks (
               id, channel_id, planning_page_ref, title, topic, story_direction,
               priority, state, stage_index, completed_stages, retry_count, attempt,
               available_at, video_url, correlation_id, created_at, updated_at
           ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, 0, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(id.as_str())
    .bind(&prior.channel_id)
    .bind(&prior.planning_page_ref)
    .bind(&prior.title)
    .bind(&prior.topic)
    .bind(&prior.story_direction)
    .bind(prior.priority)
    .bind(resume_stage)
    .bind(prior.completed_stages)
    .bind(prior.attempt + 1)
    .bind(&now)
    .bind(&prior.video_url)
    .bind(&prior.correlation_id)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .context("insert retry attempt")?;

    get_task(pool, id.as_str())
        .await?
        .context("retry attempt vanished after insert")
}

pub async fn get_task(pool: &DbPool, id: &str) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// The non-terminal task for a page, if one exists.
pub async fn live_task_for_page(
    pool: &DbPool,
    channel_id: &str,
    page_ref: &str,
) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"SELECT * FROM tasks
           WHERE channel_id = ? AND planning_page_ref = ?
             AND state NOT IN ('completed', 'failed', 'rejected')"#,
    )
    .bind(channel_id)
    .bind(page_ref)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// The most recent task row for a page regardless of state.
pub async fn latest_task_for_page(
    pool: &DbPool,
    channel_id: &str,
    page_ref: &str,
) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"SELECT * FROM tasks
           WHERE channel_id = ? AND planning_page_ref = ?
           ORDER BY created_at DESC, attempt DESC LIMIT 1"#,
    )
    .bind(channel_id)
    .bind(page_ref)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_tasks(
    pool: &DbPool,
    channel_id: Option<&str>,
    state: Option<TaskState>,
    limit: i64,
) -> Result<Vec<TaskRow>> {
    let mut sql = String::from("SELECT * FROM tasks WHERE 1 = 1");
    if channel_id.is_some() {
        sql.push_str(" AND channel_id = ?");
    }
    if state.is_some() {
        sql.push_str(" AND state = ?");
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, TaskRow>(&sql);
    if let Some(channel) = channel_id {
        query = query.bind(channel);
    }
    if let Some(state) = state {
        query = query.bind(state.as_db_str());
    }
    let rows = query.bind(limit).fetch_all(pool).await?;
    Ok(rows)
}

/// Claimable work currently visible to the dispatcher.
pub async fn queue_depth(pool: &DbPool) -> Result<i64> {
    let depth: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM tasks
           WHERE state IN ('pending', 'retry', 'approved') AND available_at <= ?"#,
    )
    .bind(now_rfc3339())
    .fetch_one(pool)
    .await?;
    Ok(depth)
}

pub async fn in_flight_total(pool: &DbPool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE state IN ('claimed', 'processing')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn in_flight_for_channel(pool: &DbPool, channel_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE channel_id = ? AND state IN ('claimed', 'processing')",
    )
    .bind(channel_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Skip forward past an already-completed stage (resume path).
pub async fn set_stage_index(pool: &DbPool, id: &str, index: i64) -> Result<()> {
    sqlx::query("UPDATE tasks SET stage_index = ?, updated_at = ? WHERE id = ?")
        .bind(index)
        .bind(now_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Defensive resume: overwrite the bitmap after checking the workspace for
/// stages whose outputs vanished.
pub async fn set_completed_stages(pool: &DbPool, id: &str, bitmap: u32) -> Result<()> {
    sqlx::query("UPDATE tasks SET completed_stages = ?, updated_at = ? WHERE id = ?")
        .bind(bitmap as i64)
        .bind(now_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Entry to `processing`: stamp the stage and clear the previous error.
pub async fn mark_stage_started(pool: &DbPool, id: &str, stage: Stage) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'processing', stage_index = ?,
               error_kind = NULL, error_log = NULL, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(stage.index() as i64)
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stage-end bookkeeping on the engine's transaction handle: set the stage
/// bit and either advance to the next stage or park at a review gate.
pub async fn tx_finish_stage(
    conn: &mut sqlx::SqliteConnection,
    task: &TaskRow,
    stage: Stage,
    park_for_review: bool,
) -> std::result::Result<(), sqlx::Error> {
    let bitmap = set_stage(task.bitmap(), stage) as i64;
    if park_for_review {
        sqlx::query(
            r#"UPDATE tasks SET completed_stages = ?, state = 'awaiting_review',
                   claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(bitmap)
        .bind(now_rfc3339())
        .bind(&task.id)
        .execute(conn)
        .await?;
    } else {
        let next = (stage.index() as i64 + 1).min(Stage::Finalize.index() as i64);
        sqlx::query(
            r#"UPDATE tasks SET completed_stages = ?, stage_index = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(bitmap)
        .bind(next)
        .bind(now_rfc3339())
        .bind(&task.id)
        .execute(conn)
        .await?;
    }
    Ok(())
}

/// Record the published video URL (stage-end transaction of the upload
/// stage).
pub async fn tx_set_video_url(
    conn: &mut sqlx::SqliteConnection,
    id: &str,
    url: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("UPDATE tasks SET video_url = ?, updated_at = ? WHERE id = ?")
        .bind(url)
        .bind(now_rfc3339())
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Retriable failure: schedule the next attempt.
pub async fn schedule_retry(
    pool: &DbPool,
    id: &str,
    retry_count: i64,
    error: &ErrorLog,
    available_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'retry', retry_count = ?,
               error_kind = ?, error_log = ?, available_at = ?,
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(retry_count)
    .bind(error.kind.as_db_str())
    .bind(error.to_json())
    .bind(available_at.to_rfc3339())
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Quota exhaustion: back to `pending` at the next UTC midnight without
/// touching the retry budget.
pub async fn park_pending(
    pool: &DbPool,
    id: &str,
    error: &ErrorLog,
    available_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'pending',
               error_kind = ?, error_log = ?, available_at = ?,
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(error.kind.as_db_str())
    .bind(error.to_json())
    .bind(available_at.to_rfc3339())
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fail_task(pool: &DbPool, id: &str, error: &ErrorLog) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'failed',
               error_kind = ?, error_log = ?,
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(error.kind.as_db_str())
    .bind(error.to_json())
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reviewer rejection: terminal until a manual retry. The gated stage's bit
/// is cleared so the retry regenerates its outputs.
pub async fn reject_task(
    pool: &DbPool,
    task: &TaskRow,
    gated_stage: Stage,
    error: &ErrorLog,
) -> Result<()> {
    let bitmap = (task.bitmap() & !reelforge_protocol::stage_bit(gated_stage)) as i64;
    sqlx::query(
        r#"UPDATE tasks SET state = 'rejected', completed_stages = ?,
               error_kind = ?, error_log = ?,
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(bitmap)
    .bind(error.kind.as_db_str())
    .bind(error.to_json())
    .bind(now_rfc3339())
    .bind(&task.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Gate approval: resume at the stage after the gate.
pub async fn approve_task(pool: &DbPool, id: &str, resume_stage: Stage) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'approved', stage_index = ?, available_at = ?,
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(resume_stage.index() as i64)
    .bind(now_rfc3339())
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn complete_task(pool: &DbPool, id: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'completed',
               claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(now_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Manual retry from `failed`/`rejected`: back to `pending` at the first
/// incomplete stage as a new attempt.
pub async fn manual_retry(
    pool: &DbPool,
    task: &TaskRow,
    resume_stage: Stage,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE tasks SET state = 'pending', stage_index = ?, retry_count = 0,
               attempt = ?, error_kind = NULL, error_log = NULL, available_at = ?,
               updated_at = ?
           WHERE id = ?"#,
    )
    .bind(resume_stage.index() as i64)
    .bind(task.attempt + 1)
    .bind(now_rfc3339())
    .bind(now_rfc3339())
    .bind(&task.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Monotonic mirror stamp: an older status never overwrites a newer one.
pub async fn update_mirror_stamp(
    pool: &DbPool,
    id: &str,
    label: &str,
    posted_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"UPDATE tasks SET mirrored_label = ?, mirrored_at = ?
           WHERE id = ? AND (mirrored_at IS NULL OR mirrored_at <= ?)"#,
    )
    .bind(label)
    .bind(posted_at.to_rfc3339())
    .bind(id)
    .bind(posted_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::channels::upsert_channel;
    use crate::registry::test_support::config_for;

    async fn pool_with_channel(channel: &str) -> DbPool {
        let pool = reelforge_db::open_memory().await.unwrap();
        upsert_channel(&pool, &config_for(channel)).await.unwrap();
        pool
    }

    fn new_task(channel: &str, page: &str) -> NewTask {
        NewTask {
            channel_id: channel.to_string(),
            planning_page_ref: page.to_string(),
            title: "Volcanoes".to_string(),
            topic: "geology".to_string(),
            story_direction: "educational".to_string(),
            priority: Priority::Normal,
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_while_live() {
        let pool = pool_with_channel("alpha").await;
        let first = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();
        let second = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();
        assert_eq!(first.id, second.id);

        fail_task(
            &pool,
            &first.id,
            &ErrorLog::new(0, reelforge_protocol::ErrorKind::PermanentClient, "boom", 0),
        )
        .await
        .unwrap();

        let third = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();
        assert_ne!(first.id, third.id);
    }

    #[tokio::test]
    async fn retry_attempt_resumes_from_first_incomplete_stage() {
        let pool = pool_with_channel("alpha").await;
        let task = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();

        // Stages 0 and 1 done, then a terminal failure at stage 2.
        sqlx::query("UPDATE tasks SET completed_stages = 3, stage_index = 2, state = 'failed' WHERE id = ?")
            .bind(&task.id)
            .execute(&pool)
            .await
            .unwrap();
        let failed = get_task(&pool, &task.id).await.unwrap().unwrap();

        let fresh = enqueue_retry_attempt(&pool, &failed).await.unwrap();
        assert_eq!(fresh.attempt, 2);
        assert_eq!(fresh.stage_index, 2);
        assert_eq!(fresh.completed_stages, 3);
        assert_eq!(fresh.state, "pending");
        assert_eq!(fresh.retry_count, 0);
    }

    #[tokio::test]
    async fn mirror_stamp_is_monotonic() {
        let pool = pool_with_channel("alpha").await;
        let task = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();

        let newer = Utc::now();
        let older = newer - chrono::Duration::seconds(30);

        assert!(update_mirror_stamp(&pool, &task.id, "Claimed", newer).await.unwrap());
        // An older post must not overwrite the newer stamp.
        assert!(!update_mirror_stamp(&pool, &task.id, "Queued", older).await.unwrap());

        let row = get_task(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(row.mirrored_label.as_deref(), Some("Claimed"));
    }

    #[tokio::test]
    async fn rejection_clears_the_gated_stage_bit() {
        let pool = pool_with_channel("alpha").await;
        let task = enqueue(&pool, &new_task("alpha", "page-1")).await.unwrap();

        sqlx::query("UPDATE tasks SET completed_stages = 7, stage_index = 2, state = 'awaiting_review' WHERE id = ?")
            .bind(&task.id)
            .execute(&pool)
            .await
            .unwrap();
        let row = get_task(&pool, &task.id).await.unwrap().unwrap();

        reject_task(
            &pool,
            &row,
            Stage::GenerateVideo,
            &ErrorLog::new(2, reelforge_protocol::ErrorKind::ReviewRejected, "clip 7 glitched", 0),
        )
        .await
        .unwrap();

        let rejected = get_task(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(rejected.state, "rejected");
        // Bit 2 cleared, bits 0 and 1 kept.
        assert_eq!(rejected.completed_stages, 3);
    }
}
