//! Persistence layer for Reelforge.
//!
//! One SQLite database holds all shared mutable state: the task queue, the
//! upload quota ledger, reviews, costs and the audit log. This crate owns
//! pool creation, schema setup and the short-transaction helper that keeps
//! subprocess and network I/O out of open transactions.

pub mod error;
pub mod pool;
pub mod schema;
pub mod tx;

pub use error::{DbError, Result};
pub use pool::{connect, DbConfig, DbPool};
pub use schema::ensure_schema;
pub use tx::{with_tx, with_tx_ceiling, DEFAULT_TX_CEILING};

/// Open a database, apply pragmas and make sure the schema exists.
///
/// The usual entry point for binaries and tests.
pub async fn open(config: DbConfig) -> Result<DbPool> {
    let pool = connect(config).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database with schema applied, for tests.
pub async fn open_memory() -> Result<DbPool> {
    open(DbConfig::memory()).await
}
