//! Database error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("Transaction exceeded wall-clock ceiling ({elapsed_ms} ms > {ceiling_ms} ms); \
             blocking I/O must not run inside a transaction")]
    TxCeilingExceeded { elapsed_ms: u128, ceiling_ms: u128 },

    #[error("Schema setup failed: {0}")]
    Schema(String),
}
