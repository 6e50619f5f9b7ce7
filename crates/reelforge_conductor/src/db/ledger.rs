//! Upload quota ledger: reserve-before-spend.
//!
//! The reservation runs in one short transaction; the API call happens
//! afterwards, outside any transaction. A reservation that would cross the
//! ceiling fails without touching the row (B2), and the first crossing of
//! 80% utilization is reported exactly once per (channel, day).

use super::models::LedgerRow;
use anyhow::Result;
use reelforge_db::{with_tx, DbError, DbPool};

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaOutcome {
    Reserved {
        used_after: i64,
        ceiling: i64,
        /// True exactly once: this reservation crossed 80% utilization.
        crossed_80: bool,
    },
    Exhausted {
        used: i64,
        ceiling: i64,
    },
}

/// Atomically reserve `cost` units for `(channel, date)`. Creates the
/// ledger row with `ceiling` on first use of the day.
pub async fn reserve_units(
    pool: &DbPool,
    channel_id: &str,
    date: &str,
    cost: i64,
    ceiling: i64,
) -> Result<QuotaOutcome> {
    let channel = channel_id.to_string();
    let date = date.to_string();

    with_tx::<_, anyhow::Error, _>(pool, move |conn| {
        Box::pin(async move {
            sqlx::query(
                r#"INSERT INTO upload_quota_ledger (channel_id, date, units_used, daily_ceiling)
                   VALUES (?, ?, 0, ?)
                   ON CONFLICT(channel_id, date) DO NOTHING"#,
            )
            .bind(&channel)
            .bind(&date)
            .bind(ceiling)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from)?;

            let row: LedgerRow = sqlx::query_as(
                "SELECT * FROM upload_quota_ledger WHERE channel_id = ? AND date = ?",
            )
            .bind(&channel)
            .bind(&date)
            .fetch_one(&mut *conn)
            .await
            .map_err(DbError::from)?;

            if row.units_used + cost > row.daily_ceiling {
                return Ok(QuotaOutcome::Exhausted {
                    used: row.units_used,
                    ceiling: row.daily_ceiling,
                });
            }

            let used_after = row.units_used + cost;
            let warn_threshold = (row.daily_ceiling * 8) / 10;
            let crossed_80 = used_after >= warn_threshold && row.warned_at_80 == 0;

            sqlx::query(
                r#"UPDATE upload_quota_ledger
                   SET units_used = ?, warned_at_80 = CASE WHEN ? THEN 1 ELSE warned_at_80 END
                   WHERE channel_id = ? AND date = ?"#,
            )
            .bind(used_after)
            .bind(crossed_80)
            .bind(&channel)
            .bind(&date)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from)?;

            Ok(QuotaOutcome::Reserved {
                used_after,
                ceiling: row.daily_ceiling,
                crossed_80,
            })
        })
    })
    .await
}

pub async fn ledger_row(
    pool: &DbPool,
    channel_id: &str,
    date: &str,
) -> Result<Option<LedgerRow>> {
    let row = sqlx::query_as::<_, LedgerRow>(
        "SELECT * FROM upload_quota_ledger WHERE channel_id = ? AND date = ?",
    )
    .bind(channel_id)
    .bind(date)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reservation_succeeds_within_ceiling() {
        let pool = reelforge_db::open_memory().await.unwrap();
        let outcome = reserve_units(&pool, "alpha", "2026-02-01", 1600, 10_000)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            QuotaOutcome::Reserved {
                used_after: 1600,
                ceiling: 10_000,
                crossed_80: false,
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_leaves_the_ledger_unchanged() {
        let pool = reelforge_db::open_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO upload_quota_ledger (channel_id, date, units_used, daily_ceiling)
             VALUES ('alpha', '2026-02-01', 8400, 10000)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let outcome = reserve_units(&pool, "alpha", "2026-02-01", 1600, 10_000)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            QuotaOutcome::Exhausted {
                used: 8400,
                ceiling: 10_000,
            }
        );

        // B2: no change on failure.
        let row = ledger_row(&pool, "alpha", "2026-02-01").await.unwrap().unwrap();
        assert_eq!(row.units_used, 8400);
    }

    #[tokio::test]
    async fn exact_fit_reserves_to_the_ceiling() {
        let pool = reelforge_db::open_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO upload_quota_ledger (channel_id, date, units_used, daily_ceiling)
             VALUES ('alpha', '2026-02-01', 8400, 10000)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let outcome = reserve_units(&pool, "alpha", "2026-02-01", 1600, 10_000)
            .await
            .unwrap();
        match outcome {
            QuotaOutcome::Reserved { used_after, .. } => assert_eq!(used_after, 10_000),
            other => panic!("expected Reserved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eighty_percent_warning_fires_once() {
        let pool = reelforge_db::open_memory().await.unwrap();

        let first = reserve_units(&pool, "alpha", "2026-02-01", 8000, 10_000)
            .await
            .unwrap();
        assert!(matches!(first, QuotaOutcome::Reserved { crossed_80: true, .. }));

        let second = reserve_units(&pool, "alpha", "2026-02-01", 1000, 10_000)
            .await
            .unwrap();
        assert!(matches!(second, QuotaOutcome::Reserved { crossed_80: false, .. }));
    }

    #[tokio::test]
    async fn per_channel_and_per_day_isolation() {
        let pool = reelforge_db::open_memory().await.unwrap();
        reserve_units(&pool, "alpha", "2026-02-01", 9000, 10_000).await.unwrap();

        // A different channel and a different day are untouched.
        let beta = reserve_units(&pool, "beta", "2026-02-01", 1600, 10_000).await.unwrap();
        assert!(matches!(beta, QuotaOutcome::Reserved { used_after: 1600, .. }));
        let next_day = reserve_units(&pool, "alpha", "2026-02-02", 1600, 10_000).await.unwrap();
        assert!(matches!(next_day, QuotaOutcome::Reserved { used_after: 1600, .. }));
    }
}
