//! Database schema creation for all Reelforge tables.
//!
//! All CREATE TABLE statements live here - single source of truth. Schema
//! setup runs inside `BEGIN IMMEDIATE` so concurrently booting processes
//! serialize on the write lock instead of racing.

use crate::error::{DbError, Result};
use crate::pool::DbPool;
use tracing::info;

/// Bumped whenever a statement below changes shape.
pub const SCHEMA_VERSION: i64 = 1;

/// Ensure all tables, indexes and the schema version row exist.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    let mut conn = pool.acquire().await?;

    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    let result = create_all(&mut conn).await;
    match result {
        Ok(()) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            info!("Database schema verified (version {SCHEMA_VERSION})");
            Ok(())
        }
        Err(err) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

async fn create_all(conn: &mut sqlx::SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    let existing: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(version) = existing {
        if version > SCHEMA_VERSION {
            return Err(DbError::Schema(format!(
                "database schema version {version} is newer than this binary ({SCHEMA_VERSION})"
            )));
        }
    }

    // Channels: one row per configured tenant. Never deleted; a removed
    // config file only flips is_active.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            channel_name TEXT NOT NULL,
            planning_db_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            priority_weight INTEGER NOT NULL DEFAULT 1,
            max_concurrent INTEGER NOT NULL DEFAULT 3,
            voice_id TEXT,
            intro_path TEXT,
            outro_path TEXT,
            storage_strategy TEXT NOT NULL DEFAULT 'local',
            upload_privacy TEXT NOT NULL DEFAULT 'private',
            daily_spend_cap_usd REAL,
            last_served_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    // Encrypted credential envelopes, one per (channel, kind).
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS channel_credentials (
            channel_id TEXT NOT NULL REFERENCES channels(channel_id),
            kind TEXT NOT NULL,
            nonce BLOB NOT NULL,
            ciphertext BLOB NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (channel_id, kind)
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    // Tasks double as the dispatcher queue; the partial unique index below
    // enforces one live row per planning page.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL REFERENCES channels(channel_id),
            planning_page_ref TEXT NOT NULL,
            title TEXT NOT NULL,
            topic TEXT NOT NULL DEFAULT '',
            story_direction TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 1,
            state TEXT NOT NULL DEFAULT 'pending',
            stage_index INTEGER NOT NULL DEFAULT 0,
            completed_stages INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            attempt INTEGER NOT NULL DEFAULT 1,
            available_at TEXT NOT NULL,
            claimed_by TEXT,
            claimed_at TEXT,
            lease_expires_at TEXT,
            error_kind TEXT,
            error_log TEXT,
            video_url TEXT,
            correlation_id TEXT NOT NULL,
            mirrored_label TEXT,
            mirrored_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_page
           ON tasks(channel_id, planning_page_ref)
           WHERE state NOT IN ('completed', 'failed', 'rejected')"#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, available_at)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_channel ON tasks(channel_id, state)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks(lease_expires_at)")
        .execute(&mut *conn)
        .await?;

    // Reviews: at most one decisive review per (task, gate, attempt).
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS reviews (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            gate TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            reviewer TEXT NOT NULL,
            decision TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (task_id, gate, attempt)
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS cost_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            channel_id TEXT NOT NULL,
            component TEXT NOT NULL,
            units REAL NOT NULL,
            usd_cost REAL NOT NULL,
            api_calls INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_costs_task ON cost_entries(task_id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_costs_channel_day ON cost_entries(channel_id, created_at)",
    )
    .execute(&mut *conn)
    .await?;

    // Append-only. No UPDATE or DELETE statement for this table exists
    // anywhere in the codebase.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            channel_id TEXT,
            task_id TEXT,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            note TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        )"#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_log(task_id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_channel ON audit_log(channel_id)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action, created_at)")
        .execute(&mut *conn)
        .await?;

    // Per-(channel, UTC date) upload unit ledger.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS upload_quota_ledger (
            channel_id TEXT NOT NULL,
            date TEXT NOT NULL,
            units_used INTEGER NOT NULL DEFAULT 0,
            daily_ceiling INTEGER NOT NULL,
            warned_at_80 INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (channel_id, date)
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    // Inbound idempotency: the last observation key per planning page.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS inbound_observations (
            channel_id TEXT NOT NULL,
            page_ref TEXT NOT NULL,
            status_label TEXT NOT NULL,
            observed_updated_at TEXT NOT NULL,
            PRIMARY KEY (channel_id, page_ref)
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    // Webhook verification handshake tokens.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS webhook_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            verification_token TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(&mut *conn)
    .await?;

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"INSERT INTO schema_version (id, version, applied_at) VALUES (1, ?, ?)
           ON CONFLICT(id) DO UPDATE SET version = excluded.version,
                                         applied_at = excluded.applied_at"#,
    )
    .bind(SCHEMA_VERSION)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{connect, DbConfig};

    #[tokio::test]
    async fn schema_applies_and_is_idempotent() {
        let pool = connect(DbConfig::memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn live_page_uniqueness_frees_on_terminal_state() {
        let pool = connect(DbConfig::memory()).await.unwrap();
        ensure_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO channels (channel_id, channel_name, planning_db_id, created_at, updated_at)
             VALUES ('alpha', 'Alpha', 'DB-1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let insert = |id: &'static str, state: &'static str| {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "INSERT INTO tasks (id, channel_id, planning_page_ref, title, state,
                                        available_at, correlation_id, created_at, updated_at)
                     VALUES (?, 'alpha', 'page-1', 't', ?, '2026-01-01T00:00:00Z', 'c',
                             '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                )
                .bind(id)
                .bind(state)
                .execute(&pool)
                .await
            }
        };

        insert("t1", "pending").await.unwrap();
        // A second live task for the same page violates the partial index.
        assert!(insert("t2", "pending").await.is_err());

        sqlx::query("UPDATE tasks SET state = 'failed' WHERE id = 't1'")
            .execute(&pool)
            .await
            .unwrap();
        // Terminal state frees the slot.
        insert("t3", "pending").await.unwrap();
    }
}
