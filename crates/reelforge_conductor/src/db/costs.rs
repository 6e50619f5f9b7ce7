//! Cost entries: one row per external-API charge.

use super::models::CostEntryRow;
use super::now_rfc3339;
use anyhow::Result;
use reelforge_db::DbPool;

/// Record a charge on the engine's stage-end transaction.
pub async fn tx_record_cost(
    conn: &mut sqlx::SqliteConnection,
    task_id: &str,
    channel_id: &str,
    component: &str,
    units: f64,
    usd_cost: f64,
    api_calls: i64,
    metadata: &serde_json::Value,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO cost_entries
               (task_id, channel_id, component, units, usd_cost, api_calls, metadata, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(task_id)
    .bind(channel_id)
    .bind(component)
    .bind(units)
    .bind(usd_cost)
    .bind(api_calls)
    .bind(metadata.to_string())
    .bind(now_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn costs_for_task(pool: &DbPool, task_id: &str) -> Result<Vec<CostEntryRow>> {
    let rows = sqlx::query_as::<_, CostEntryRow>(
        "SELECT * FROM cost_entries WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// USD spent by a channel on a UTC calendar day (`date` is `YYYY-MM-DD`).
pub async fn daily_spend(pool: &DbPool, channel_id: &str, date: &str) -> Result<f64> {
    let spend: Option<f64> = sqlx::query_scalar(
        r#"SELECT SUM(usd_cost) FROM cost_entries
           WHERE channel_id = ? AND substr(created_at, 1, 10) = ?"#,
    )
    .bind(channel_id)
    .bind(date)
    .fetch_one(pool)
    .await?;
    Ok(spend.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::channels::upsert_channel;
    use crate::db::tasks::{enqueue, NewTask};
    use crate::registry::test_support::config_for;
    use reelforge_db::with_tx;
    use reelforge_protocol::Priority;

    #[tokio::test]
    async fn records_and_sums_costs() {
        let pool = reelforge_db::open_memory().await.unwrap();
        upsert_channel(&pool, &config_for("alpha")).await.unwrap();
        let task = enqueue(
            &pool,
            &NewTask {
                channel_id: "alpha".into(),
                planning_page_ref: "p1".into(),
                title: "t".into(),
                topic: String::new(),
                story_direction: String::new(),
                priority: Priority::Normal,
            },
        )
        .await
        .unwrap();

        let task_id = task.id.clone();
        with_tx::<_, anyhow::Error, _>(&pool, move |conn| {
            Box::pin(async move {
                tx_record_cost(
                    conn,
                    &task_id,
                    "alpha",
                    "video_clips",
                    18.0,
                    9.0,
                    18,
                    &serde_json::json!({"regenerated": 18}),
                )
                .await
                .map_err(reelforge_db::DbError::from)?;
                tx_record_cost(conn, &task_id, "alpha", "narration", 18.0, 1.44, 18, &serde_json::json!({}))
                    .await
                    .map_err(reelforge_db::DbError::from)?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let entries = costs_for_task(&pool, &task.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].component, "video_clips");

        let today = super::super::today_utc();
        let spend = daily_spend(&pool, "alpha", &today).await.unwrap();
        assert!((spend - 10.44).abs() < 1e-9);
    }
}
