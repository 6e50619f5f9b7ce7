//! Channel rows and encrypted credential envelopes.

use super::models::ChannelRow;
use super::now_rfc3339;
use crate::registry::ChannelConfig;
use anyhow::{Context, Result};
use reelforge_db::DbPool;
use reelforge_vault::{CredentialKind, Envelope};

/// Insert or update a channel from its validated config file. Existing rows
/// keep their `last_served_at` stamp.
pub async fn upsert_channel(pool: &DbPool, config: &ChannelConfig) -> Result<()> {
    let now = now_rfc3339();
    sqlx::query(
        r#"INSERT INTO channels (
               channel_id, channel_name, planning_db_id, is_active,
               priority_weight, max_concurrent, voice_id, intro_path, outro_path,
               storage_strategy, upload_privacy, daily_spend_cap_usd,
               created_at, updated_at
           ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(channel_id) DO UPDATE SET
               channel_name = excluded.channel_name,
               planning_db_id = excluded.planning_db_id,
               is_active = excluded.is_active,
               priority_weight = excluded.priority_weight,
               max_concurrent = excluded.max_concurrent,
               voice_id = excluded.voice_id,
               intro_path = excluded.intro_path,
               outro_path = excluded.outro_path,
               storage_strategy = excluded.storage_strategy,
               upload_privacy = excluded.upload_privacy,
               daily_spend_cap_usd = excluded.daily_spend_cap_usd,
               updated_at = excluded.updated_at"#,
    )
    .bind(config.channel_id.as_str())
    .bind(&config.channel_name)
    .bind(&config.planning_db_database_id)
    .bind(if config.is_active { 1i64 } else { 0i64 })
    .bind(config.priority_weight)
    .bind(config.max_concurrent)
    .bind(&config.voice_id)
    .bind(config.branding.intro_path.as_ref().map(|p| p.display().to_string()))
    .bind(config.branding.outro_path.as_ref().map(|p| p.display().to_string()))
    .bind(&config.storage_strategy)
    .bind(&config.upload_privacy_default)
    .bind(config.daily_spend_cap_usd)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .with_context(|| format!("upsert channel {}", config.channel_id))?;
    Ok(())
}

/// Mark channels whose config files disappeared as inactive. Rows are kept
/// for audit; only the dispatcher stops serving them.
pub async fn deactivate_missing(pool: &DbPool, seen: &[String]) -> Result<u64> {
    let now = now_rfc3339();
    let placeholders = if seen.is_empty() {
        "''".to_string()
    } else {
        vec!["?"; seen.len()].join(", ")
    };
    let sql = format!(
        "UPDATE channels SET is_active = 0, updated_at = ?
         WHERE is_active = 1 AND channel_id NOT IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql).bind(&now);
    for id in seen {
        query = query.bind(id);
    }
    let result = query.execute(pool).await.context("deactivate channels")?;
    Ok(result.rows_affected())
}

pub async fn get_channel(pool: &DbPool, channel_id: &str) -> Result<Option<ChannelRow>> {
    let row = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels WHERE channel_id = ?")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_channels(pool: &DbPool) -> Result<Vec<ChannelRow>> {
    let rows = sqlx::query_as::<_, ChannelRow>("SELECT * FROM channels ORDER BY channel_id")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn list_active_channels(pool: &DbPool) -> Result<Vec<ChannelRow>> {
    let rows = sqlx::query_as::<_, ChannelRow>(
        "SELECT * FROM channels WHERE is_active = 1 ORDER BY channel_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Stamp the fair-scheduling clock for a channel.
pub async fn touch_last_served(
    conn: &mut sqlx::SqliteConnection,
    channel_id: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query("UPDATE channels SET last_served_at = ? WHERE channel_id = ?")
        .bind(now_rfc3339())
        .bind(channel_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Store an encrypted credential envelope.
pub async fn store_credential(
    pool: &DbPool,
    channel_id: &str,
    kind: CredentialKind,
    envelope: &Envelope,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO channel_credentials (channel_id, kind, nonce, ciphertext, updated_at)
           VALUES (?, ?, ?, ?, ?)
           ON CONFLICT(channel_id, kind) DO UPDATE SET
               nonce = excluded.nonce,
               ciphertext = excluded.ciphertext,
               updated_at = excluded.updated_at"#,
    )
    .bind(channel_id)
    .bind(kind.as_db_str())
    .bind(&envelope.nonce)
    .bind(&envelope.ciphertext)
    .bind(now_rfc3339())
    .execute(pool)
    .await
    .with_context(|| format!("store {kind} credential for {channel_id}"))?;
    Ok(())
}

/// Load an encrypted credential envelope, if present.
pub async fn load_credential(
    pool: &DbPool,
    channel_id: &str,
    kind: CredentialKind,
) -> Result<Option<Envelope>> {
    let row: Option<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
        "SELECT nonce, ciphertext FROM channel_credentials WHERE channel_id = ? AND kind = ?",
    )
    .bind(channel_id)
    .bind(kind.as_db_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(nonce, ciphertext)| Envelope { nonce, ciphertext }))
}
