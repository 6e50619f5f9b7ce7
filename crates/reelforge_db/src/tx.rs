//! Short-transaction helper.
//!
//! Every transaction in the system goes through `with_tx`, which measures
//! the wall-clock time the transaction stayed open and refuses to commit one
//! that exceeded the ceiling. Subprocess execution and outbound API calls
//! therefore cannot hide inside a transaction: they would blow the ceiling
//! and fail loudly in tests and in production.

use crate::error::DbError;
use crate::pool::DbPool;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::error;

/// Default wall-clock ceiling for an open transaction.
pub const DEFAULT_TX_CEILING: Duration = Duration::from_secs(2);

/// Future type returned by `with_tx` closures.
pub type TxFuture<'c, T, E> = Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'c>>;

/// Run `f` inside a transaction with the default ceiling.
pub async fn with_tx<T, E, F>(pool: &DbPool, f: F) -> std::result::Result<T, E>
where
    E: From<DbError>,
    F: for<'c> FnOnce(&'c mut sqlx::SqliteConnection) -> TxFuture<'c, T, E>,
{
    with_tx_ceiling(pool, DEFAULT_TX_CEILING, f).await
}

/// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
///
/// If the transaction stayed open longer than `ceiling`, it is rolled back
/// even on `Ok` and the call fails with `DbError::TxCeilingExceeded`.
pub async fn with_tx_ceiling<T, E, F>(
    pool: &DbPool,
    ceiling: Duration,
    f: F,
) -> std::result::Result<T, E>
where
    E: From<DbError>,
    F: for<'c> FnOnce(&'c mut sqlx::SqliteConnection) -> TxFuture<'c, T, E>,
{
    let started = Instant::now();
    let mut tx = pool.begin().await.map_err(DbError::from)?;

    let result = f(&mut *tx).await;
    let elapsed = started.elapsed();

    match result {
        Ok(value) => {
            if elapsed > ceiling {
                error!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    ceiling_ms = ceiling.as_millis() as u64,
                    "transaction exceeded wall-clock ceiling; rolling back"
                );
                let _ = tx.rollback().await;
                return Err(DbError::TxCeilingExceeded {
                    elapsed_ms: elapsed.as_millis(),
                    ceiling_ms: ceiling.as_millis(),
                }
                .into());
            }
            tx.commit().await.map_err(DbError::from)?;
            Ok(value)
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}
