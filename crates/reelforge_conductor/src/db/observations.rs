//! Inbound observation keys: idempotency for the planning-database poll and
//! webhook.

use anyhow::Result;
use reelforge_db::DbPool;

/// True when `(page, label, updated_at)` was already processed.
pub async fn already_seen(
    pool: &DbPool,
    channel_id: &str,
    page_ref: &str,
    status_label: &str,
    updated_at: &str,
) -> Result<bool> {
    let row: Option<(String, String)> = sqlx::query_as(
        r#"SELECT status_label, observed_updated_at FROM inbound_observations
           WHERE channel_id = ? AND page_ref = ?"#,
    )
    .bind(channel_id)
    .bind(page_ref)
    .fetch_optional(pool)
    .await?;

    Ok(matches!(row, Some((label, at)) if label == status_label && at == updated_at))
}

/// Record the latest observation key for a page.
pub async fn record(
    pool: &DbPool,
    channel_id: &str,
    page_ref: &str,
    status_label: &str,
    updated_at: &str,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO inbound_observations (channel_id, page_ref, status_label, observed_updated_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(channel_id, page_ref) DO UPDATE SET
               status_label = excluded.status_label,
               observed_updated_at = excluded.observed_updated_at"#,
    )
    .bind(channel_id)
    .bind(page_ref)
    .bind(status_label)
    .bind(updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeat_observations_are_detected() {
        let pool = reelforge_db::open_memory().await.unwrap();
        assert!(!already_seen(&pool, "alpha", "p1", "Queued", "t1").await.unwrap());

        record(&pool, "alpha", "p1", "Queued", "t1").await.unwrap();
        assert!(already_seen(&pool, "alpha", "p1", "Queued", "t1").await.unwrap());

        // A newer edit or different label is a fresh observation.
        assert!(!already_seen(&pool, "alpha", "p1", "Queued", "t2").await.unwrap());
        assert!(!already_seen(&pool, "alpha", "p1", "Approved", "t1").await.unwrap());
    }
}
