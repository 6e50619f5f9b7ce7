//! Pool creation and SQLite pragmas.

use crate::error::{DbError, Result};
use tracing::info;

/// Concrete pool type. One SQLite store backs the whole deployment; using
/// the concrete type keeps `#[derive(FromRow)]` fully usable with enums and
/// chrono columns.
pub type DbPool = sqlx::SqlitePool;

/// Database row type for manual decoding.
pub type DbRow = sqlx::sqlite::SqliteRow;

/// Bounded pool: 10 steady connections plus headroom for bursts.
const DEFAULT_MAX_CONNECTIONS: u32 = 15;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// Build from a `DATABASE_URL`-style value: either a `sqlite:` URL or a
    /// bare filesystem path.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(DbError::InvalidUrl(url));
        }
        let url = if url.starts_with("sqlite:") {
            url
        } else {
            format!("sqlite:{url}?mode=rwc")
        };
        Ok(Self {
            url,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// In-memory database (for testing).
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            // A single connection so every query sees the same in-memory db.
            max_connections: 1,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a pool and apply SQLite pragmas.
pub async fn connect(config: DbConfig) -> Result<DbPool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    // WAL mode for concurrent readers alongside a single writer.
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

    info!("Connected to database at {}", config.url);
    Ok(pool)
}
