//! Append-only audit log.
//!
//! Compliance surface: every human-initiated action lands here with the
//! actor identifier. There is deliberately no update or delete function in
//! this module, and none elsewhere touches the table.

use super::models::AuditRow;
use super::now_rfc3339;
use anyhow::Result;
use reelforge_db::DbPool;

/// Action tags recorded by the system.
pub mod actions {
    pub const CHANNEL_REGISTERED: &str = "channel_registered";
    pub const CHANNEL_DEACTIVATED: &str = "channel_deactivated";
    pub const REVIEW_APPROVED: &str = "review_approved";
    pub const REVIEW_REJECTED: &str = "review_rejected";
    pub const MANUAL_RETRY: &str = "manual_retry";
    pub const MIRROR_DROPPED: &str = "mirror_dropped";
    pub const TASK_FAILED: &str = "task_failed";
}

pub async fn append(
    pool: &DbPool,
    channel_id: Option<&str>,
    task_id: Option<&str>,
    action: &str,
    actor: &str,
    note: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO audit_log (created_at, channel_id, task_id, action, actor, note, metadata)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(now_rfc3339())
    .bind(channel_id)
    .bind(task_id)
    .bind(action)
    .bind(actor)
    .bind(note)
    .bind(metadata.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn by_task(pool: &DbPool, task_id: &str) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query_as::<_, AuditRow>(
        "SELECT * FROM audit_log WHERE task_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn by_channel(pool: &DbPool, channel_id: &str, limit: i64) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query_as::<_, AuditRow>(
        "SELECT * FROM audit_log WHERE channel_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(channel_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn by_action(pool: &DbPool, action: &str, limit: i64) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query_as::<_, AuditRow>(
        "SELECT * FROM audit_log WHERE action = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(action)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn in_range(pool: &DbPool, from: &str, to: &str) -> Result<Vec<AuditRow>> {
    let rows = sqlx::query_as::<_, AuditRow>(
        r#"SELECT * FROM audit_log WHERE created_at >= ? AND created_at < ?
           ORDER BY created_at ASC, id ASC"#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
