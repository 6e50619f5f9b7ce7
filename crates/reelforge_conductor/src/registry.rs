//! Channel registry: config files, capacity counters, upload quiescing.
//!
//! One YAML file per channel in the config directory. A broken file is
//! rejected with a precise message and never blocks the other channels;
//! removed files mark their channel inactive but keep its rows. Inline
//! plaintext credentials are sealed through the vault during reload and
//! never stored or logged in the clear.

use crate::db::{audit, channels};
use anyhow::{Context, Result};
use reelforge_db::DbPool;
use reelforge_protocol::ChannelId;
use reelforge_vault::{CredentialKind, Vault};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Per-channel defaults.
const DEFAULT_PRIORITY_WEIGHT: i64 = 1;
const DEFAULT_MAX_CONCURRENT: i64 = 3;
const DEFAULT_STORAGE_STRATEGY: &str = "local";
const DEFAULT_UPLOAD_PRIVACY: &str = "private";

#[derive(Debug, Clone, Default)]
pub struct Branding {
    pub intro_path: Option<PathBuf>,
    pub outro_path: Option<PathBuf>,
}

/// A validated channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub planning_db_database_id: String,
    pub priority_weight: i64,
    pub max_concurrent: i64,
    pub voice_id: Option<String>,
    pub branding: Branding,
    pub storage_strategy: String,
    pub upload_privacy_default: String,
    pub daily_spend_cap_usd: Option<f64>,
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
struct RawBranding {
    intro_path: Option<PathBuf>,
    outro_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawCredentials {
    planning_token: Option<String>,
    upload_refresh_token: Option<String>,
    model_provider_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannelFile {
    channel_id: Option<String>,
    channel_name: Option<String>,
    planning_db_database_id: Option<String>,
    priority_weight: Option<i64>,
    max_concurrent: Option<i64>,
    voice_id: Option<String>,
    branding: Option<RawBranding>,
    storage_strategy: Option<String>,
    upload_privacy_default: Option<String>,
    daily_spend_cap_usd: Option<f64>,
    is_active: Option<bool>,
    credentials: Option<RawCredentials>,
}

/// What one reload pass saw.
#[derive(Debug, Default)]
pub struct ReloadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<(PathBuf, String)>,
    pub deactivated: u64,
}

pub struct ChannelRegistry {
    config_dir: PathBuf,
    channels: RwLock<HashMap<String, ChannelConfig>>,
    in_flight: Mutex<HashMap<String, i64>>,
    upload_quiesced: Mutex<HashSet<String>>,
}

impl ChannelRegistry {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            channels: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            upload_quiesced: Mutex::new(HashSet::new()),
        }
    }

    /// Scan the config directory, validate every file, upsert rows and seal
    /// any inline credentials. Runs at startup and on reload signal.
    pub async fn reload(&self, pool: &DbPool, vault: &Vault) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        let mut seen = Vec::new();
        let mut loaded = HashMap::new();

        let entries = std::fs::read_dir(&self.config_dir)
            .with_context(|| format!("read config dir {}", self.config_dir.display()))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            match load_channel_file(&path) {
                Ok((config, credentials)) => {
                    let is_new = channels::get_channel(pool, config.channel_id.as_str())
                        .await?
                        .is_none();
                    channels::upsert_channel(pool, &config).await?;

                    if let Some(credentials) = credentials {
                        seal_credentials(pool, vault, &config, &credentials).await?;
                        // A renewed upload credential lifts the reauth pause.
                        if credentials.upload_refresh_token.is_some() {
                            self.resume_uploads(config.channel_id.as_str());
                        }
                    }

                    if is_new {
                        audit::append(
                            pool,
                            Some(config.channel_id.as_str()),
                            None,
                            audit::actions::CHANNEL_REGISTERED,
                            "system",
                            None,
                            &serde_json::json!({"file": path.display().to_string()}),
                        )
                        .await?;
                    }

                    seen.push(config.channel_id.to_string());
                    report.loaded.push(config.channel_id.to_string());
                    loaded.insert(config.channel_id.to_string(), config);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "rejected channel config");
                    report.rejected.push((path, err.to_string()));
                }
            }
        }

        report.deactivated = channels::deactivate_missing(pool, &seen).await?;
        *self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = loaded;

        info!(
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            deactivated = report.deactivated,
            "channel registry reloaded"
        );
        Ok(report)
    }

    pub fn get(&self, channel_id: &str) -> Option<ChannelConfig> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(channel_id)
            .cloned()
    }

    pub fn active_channels(&self) -> Vec<ChannelConfig> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    /// In-flight bookkeeping for observability; the claim transaction is the
    /// cross-process authority.
    pub fn acquire_slot(&self, channel_id: &str) {
        let mut counts = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counts.entry(channel_id.to_string()).or_insert(0) += 1;
    }

    pub fn release_slot(&self, channel_id: &str) {
        let mut counts = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = counts.get_mut(channel_id) {
            *count = (*count - 1).max(0);
        }
    }

    pub fn in_flight(&self, channel_id: &str) -> i64 {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(channel_id)
            .copied()
            .unwrap_or(0)
    }

    /// Pause upload-stage claims for a channel (reauth required).
    pub fn quiesce_uploads(&self, channel_id: &str) {
        self.upload_quiesced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(channel_id.to_string());
    }

    pub fn resume_uploads(&self, channel_id: &str) {
        self.upload_quiesced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(channel_id);
    }

    pub fn upload_blocked(&self) -> HashSet<String> {
        self.upload_quiesced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn load_channel_file(path: &Path) -> Result<(ChannelConfig, Option<RawCredentials>)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let raw: RawChannelFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parse {}", path.display()))?;

    let channel_id = raw
        .channel_id
        .as_deref()
        .with_context(|| format!("{}: missing required field 'channel_id'", path.display()))?;
    let channel_id = ChannelId::parse(channel_id)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
    let channel_name = raw
        .channel_name
        .clone()
        .with_context(|| format!("{}: missing required field 'channel_name'", path.display()))?;
    let planning_db_database_id = raw.planning_db_database_id.clone().with_context(|| {
        format!(
            "{}: missing required field 'planning_db_database_id'",
            path.display()
        )
    })?;

    let storage_strategy = raw
        .storage_strategy
        .unwrap_or_else(|| DEFAULT_STORAGE_STRATEGY.to_string());
    if !matches!(storage_strategy.as_str(), "local" | "external_object_store") {
        anyhow::bail!(
            "{}: storage_strategy must be 'local' or 'external_object_store', got {storage_strategy:?}",
            path.display()
        );
    }

    let upload_privacy_default = raw
        .upload_privacy_default
        .unwrap_or_else(|| DEFAULT_UPLOAD_PRIVACY.to_string());
    if !matches!(
        upload_privacy_default.as_str(),
        "private" | "unlisted" | "public"
    ) {
        anyhow::bail!(
            "{}: upload_privacy_default must be private/unlisted/public, got {upload_privacy_default:?}",
            path.display()
        );
    }

    let max_concurrent = raw.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
    if max_concurrent < 1 {
        anyhow::bail!("{}: max_concurrent must be >= 1", path.display());
    }

    let config = ChannelConfig {
        channel_id,
        channel_name,
        planning_db_database_id,
        priority_weight: raw.priority_weight.unwrap_or(DEFAULT_PRIORITY_WEIGHT).max(1),
        max_concurrent,
        voice_id: raw.voice_id,
        branding: raw
            .branding
            .map(|b| Branding {
                intro_path: b.intro_path,
                outro_path: b.outro_path,
            })
            .unwrap_or_default(),
        storage_strategy,
        upload_privacy_default,
        daily_spend_cap_usd: raw.daily_spend_cap_usd,
        is_active: raw.is_active.unwrap_or(true),
    };
    Ok((config, raw.credentials))
}

async fn seal_credentials(
    pool: &DbPool,
    vault: &Vault,
    config: &ChannelConfig,
    credentials: &RawCredentials,
) -> Result<()> {
    let pairs = [
        (CredentialKind::PlanningToken, &credentials.planning_token),
        (
            CredentialKind::UploadRefreshToken,
            &credentials.upload_refresh_token,
        ),
        (
            CredentialKind::ModelProviderKey,
            &credentials.model_provider_key,
        ),
    ];
    for (kind, value) in pairs {
        if let Some(plaintext) = value {
            let envelope = vault
                .seal(plaintext.as_bytes())
                .map_err(|e| anyhow::anyhow!("seal {kind} for {}: {e}", config.channel_id))?;
            channels::store_credential(pool, config.channel_id.as_str(), kind, &envelope).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A minimal valid config for tests.
    pub fn config_for(channel_id: &str) -> ChannelConfig {
        ChannelConfig {
            channel_id: ChannelId::parse(channel_id).unwrap(),
            channel_name: format!("Channel {channel_id}"),
            planning_db_database_id: "DB-1".to_string(),
            priority_weight: 1,
            max_concurrent: 3,
            voice_id: None,
            branding: Branding::default(),
            storage_strategy: "local".to_string(),
            upload_privacy_default: "private".to_string(),
            daily_spend_cap_usd: None,
            is_active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, name: &str, body: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    fn vault() -> Vault {
        Vault::from_key_bytes(&[3u8; 32]).unwrap()
    }

    #[tokio::test]
    async fn loads_valid_files_and_rejects_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "alpha.yaml",
            "channel_id: alpha\nchannel_name: Alpha\nplanning_db_database_id: DB-1\nmax_concurrent: 1\n",
        );
        write_config(dir.path(), "broken.yaml", "channel_name: NoId\n");
        write_config(dir.path(), "notes.txt", "not a channel file");

        let pool = reelforge_db::open_memory().await.unwrap();
        let registry = ChannelRegistry::new(dir.path());
        let report = registry.reload(&pool, &vault()).await.unwrap();

        assert_eq!(report.loaded, vec!["alpha".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].1.contains("channel_id"));

        let config = registry.get("alpha").unwrap();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.priority_weight, 1);
        assert_eq!(config.upload_privacy_default, "private");
    }

    #[tokio::test]
    async fn removed_files_deactivate_channels() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "alpha.yaml",
            "channel_id: alpha\nchannel_name: Alpha\nplanning_db_database_id: DB-1\n",
        );
        write_config(
            dir.path(),
            "beta.yaml",
            "channel_id: beta\nchannel_name: Beta\nplanning_db_database_id: DB-2\n",
        );

        let pool = reelforge_db::open_memory().await.unwrap();
        let registry = ChannelRegistry::new(dir.path());
        registry.reload(&pool, &vault()).await.unwrap();
        assert_eq!(registry.active_channels().len(), 2);

        std::fs::remove_file(dir.path().join("beta.yaml")).unwrap();
        let report = registry.reload(&pool, &vault()).await.unwrap();
        assert_eq!(report.deactivated, 1);
        assert!(registry.get("beta").is_none());

        // The row survives for audit.
        let row = crate::db::channels::get_channel(&pool, "beta").await.unwrap().unwrap();
        assert_eq!(row.is_active, 0);
    }

    #[tokio::test]
    async fn inline_credentials_are_sealed_not_stored_plain() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "alpha.yaml",
            concat!(
                "channel_id: alpha\n",
                "channel_name: Alpha\n",
                "planning_db_database_id: DB-1\n",
                "credentials:\n",
                "  planning_token: secret-token-abc\n",
            ),
        );

        let pool = reelforge_db::open_memory().await.unwrap();
        let registry = ChannelRegistry::new(dir.path());
        let v = vault();
        registry.reload(&pool, &v).await.unwrap();

        let envelope = crate::db::channels::load_credential(
            &pool,
            "alpha",
            CredentialKind::PlanningToken,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!envelope
            .ciphertext
            .windows(b"secret-token-abc".len())
            .any(|w| w == b"secret-token-abc"));
        let plain = v
            .open(&envelope, "alpha", CredentialKind::PlanningToken)
            .unwrap();
        assert_eq!(plain, b"secret-token-abc");
    }

    #[tokio::test]
    async fn validation_rejects_bad_option_values() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "alpha.yaml",
            "channel_id: alpha\nchannel_name: A\nplanning_db_database_id: DB-1\nstorage_strategy: floppy\n",
        );
        let pool = reelforge_db::open_memory().await.unwrap();
        let registry = ChannelRegistry::new(dir.path());
        let report = registry.reload(&pool, &vault()).await.unwrap();
        assert!(report.loaded.is_empty());
        assert!(report.rejected[0].1.contains("storage_strategy"));
    }

    #[test]
    fn slot_counters_never_go_negative() {
        let registry = ChannelRegistry::new("/nonexistent");
        registry.release_slot("alpha");
        assert_eq!(registry.in_flight("alpha"), 0);
        registry.acquire_slot("alpha");
        registry.acquire_slot("alpha");
        assert_eq!(registry.in_flight("alpha"), 2);
        registry.release_slot("alpha");
        assert_eq!(registry.in_flight("alpha"), 1);
    }
}
