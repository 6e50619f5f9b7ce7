//! Shared process state threaded through dispatcher, engine, reconciler and
//! the HTTP surface.

use crate::config::Config;
use crate::registry::ChannelRegistry;
use crate::sync::MirrorQueue;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reelforge_clients::{AlertSink, OauthCache, PlanningApi, RateGate, Uploader};
use reelforge_db::DbPool;
use reelforge_protocol::{Alert, AlertSeverity};
use reelforge_runner::Supervisor;
use reelforge_vault::{CredentialKind, Vault, VaultError};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Heartbeat entry for one in-process worker.
#[derive(Debug, Clone)]
pub struct WorkerHeartbeat {
    pub last_seen: DateTime<Utc>,
    pub busy: bool,
}

pub struct AppContext {
    pub pool: DbPool,
    pub registry: ChannelRegistry,
    pub vault: Vault,
    pub supervisor: Supervisor,
    pub planning: Arc<dyn PlanningApi>,
    pub uploader: Arc<dyn Uploader>,
    pub oauth: OauthCache,
    pub alerts: Arc<dyn AlertSink>,
    pub rate_gate: Arc<RateGate>,
    pub mirror: MirrorQueue,
    /// Nudges idle workers when new work lands.
    pub wake: Notify,
    pub workspace_root: PathBuf,
    pub webhook_secret: Option<String>,
    pub poll_interval: Duration,
    pub sync_poll: Duration,
    worker_board: Mutex<HashMap<String, WorkerHeartbeat>>,
    /// `channel:date` keys that already fired the 80% spend warning.
    spend_warned: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
}

impl AppContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        config: &Config,
        vault: Vault,
        rate_gate: Arc<RateGate>,
        planning: Arc<dyn PlanningApi>,
        uploader: Arc<dyn Uploader>,
        oauth: OauthCache,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            registry: ChannelRegistry::new(&config.channel_config_dir),
            vault,
            supervisor: Supervisor::new(&config.scripts_dir),
            planning,
            uploader,
            oauth,
            alerts,
            rate_gate,
            mirror: MirrorQueue::new(),
            wake: Notify::new(),
            workspace_root: config.workspace_root.clone(),
            webhook_secret: config.webhook_secret.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            sync_poll: Duration::from_secs(config.sync_poll_secs.max(5)),
            worker_board: Mutex::new(HashMap::new()),
            spend_warned: Mutex::new(HashSet::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Decrypt a channel credential on demand. The plaintext stays on the
    /// caller's stack.
    pub async fn credential(&self, channel_id: &str, kind: CredentialKind) -> Result<String> {
        let envelope = crate::db::channels::load_credential(&self.pool, channel_id, kind)
            .await?
            .ok_or_else(|| VaultError::CredentialUnavailable {
                channel: channel_id.to_string(),
                kind: kind.as_db_str().to_string(),
            })
            .with_context(|| format!("no {kind} credential stored for {channel_id}"))?;
        let token = self
            .vault
            .open_string(&envelope, channel_id, kind)
            .with_context(|| format!("decrypt {kind} credential for {channel_id}"))?;
        Ok(token)
    }

    pub async fn alert(&self, severity: AlertSeverity, summary: &str, context: serde_json::Value) {
        self.alerts
            .post(Alert::new(severity, summary, context))
            .await;
    }

    pub fn heartbeat(&self, worker_id: &str, busy: bool) {
        let mut board = self
            .worker_board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        board.insert(
            worker_id.to_string(),
            WorkerHeartbeat {
                last_seen: Utc::now(),
                busy,
            },
        );
    }

    pub fn worker_board(&self) -> Vec<(String, WorkerHeartbeat)> {
        let board = self
            .worker_board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<_> = board
            .iter()
            .map(|(id, hb)| (id.clone(), hb.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// True the first time a `channel:date` key is seen; later calls for
    /// the same key return false so the spend warning fires once per day.
    pub fn first_spend_warning(&self, channel_id: &str, date: &str) -> bool {
        self.spend_warned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(format!("{channel_id}:{date}"))
    }

    /// Cooperative shutdown: dispatchers stop claiming, loops drain.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        self.mirror.nudge();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
