//! Shared harness for conductor integration tests: in-memory store, stub
//! pipeline scripts, fake planning/upload clients.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use reelforge_clients::{
    ClientError, PageStatus, PlanningApi, RateGate, UploadMeta, Uploader, VideoRef,
    WebhookAlertSink, OauthCache, OauthConfig,
};
use reelforge_conductor::config::Config;
use reelforge_conductor::context::AppContext;
use reelforge_conductor::db::models::TaskRow;
use reelforge_conductor::db::{queue, tasks};
use reelforge_conductor::engine;
use reelforge_protocol::StatusLabel;
use reelforge_runner::ProjectWorkspace;
use reelforge_vault::Vault;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

#[derive(Default)]
pub struct FakePlanning {
    pub status_posts: Mutex<Vec<(String, String)>>,
    pub upload_urls: Mutex<Vec<(String, String)>>,
    pub pages: Mutex<Vec<PageStatus>>,
}

#[async_trait]
impl PlanningApi for FakePlanning {
    async fn update_status(
        &self,
        _token: &str,
        page_ref: &str,
        label: StatusLabel,
        _error_summary: Option<&str>,
    ) -> Result<(), ClientError> {
        self.status_posts
            .lock()
            .unwrap()
            .push((page_ref.to_string(), label.as_str().to_string()));
        Ok(())
    }

    async fn query_recent(
        &self,
        _token: &str,
        _database_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageStatus>, ClientError> {
        Ok(self.pages.lock().unwrap().clone())
    }

    async fn write_upload_url(
        &self,
        _token: &str,
        page_ref: &str,
        url: &str,
    ) -> Result<(), ClientError> {
        self.upload_urls
            .lock()
            .unwrap()
            .push((page_ref.to_string(), url.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUploader {
    pub calls: AtomicU64,
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload_video(
        &self,
        _access_token: &str,
        _meta: &UploadMeta,
        file: &Path,
    ) -> Result<VideoRef, ClientError> {
        if !file.exists() {
            return Err(ClientError::Network(format!(
                "missing upload source {}",
                file.display()
            )));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let video_id = format!("vid-{n}");
        let url = format!("https://videos.example/watch?v={video_id}");
        Ok(VideoRef { video_id, url })
    }
}

pub struct Harness {
    pub ctx: Arc<AppContext>,
    pub planning: Arc<FakePlanning>,
    pub uploader: Arc<FakeUploader>,
    pub workspace_dir: TempDir,
    pub scripts_dir: TempDir,
    pub config_dir: TempDir,
}

/// Default stub: writes the `--out` file and exits 0.
const OUT_WRITER: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--out" ]; then out="$2"; fi
  shift
done
printf 'generated\n' > "$out"
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

pub async fn harness() -> Harness {
    harness_with_channels(&["alpha"]).await
}

pub async fn harness_with_channels(channels: &[&str]) -> Harness {
    let workspace_dir = tempfile::tempdir().unwrap();
    let scripts_dir = tempfile::tempdir().unwrap();
    let config_dir = tempfile::tempdir().unwrap();

    for program in [
        "generate_asset",
        "create_composite",
        "create_split_screen",
        "generate_video",
        "generate_audio",
        "generate_sound_effects",
        "assemble_video",
    ] {
        write_script(scripts_dir.path(), program, OUT_WRITER);
    }

    for (i, channel) in channels.iter().enumerate() {
        let config = format!(
            concat!(
                "channel_id: {ch}\n",
                "channel_name: Channel {ch}\n",
                "planning_db_database_id: DB-{i}\n",
                "max_concurrent: 2\n",
                "priority_weight: 1\n",
                "credentials:\n",
                "  planning_token: planning-token-{ch}\n",
                "  upload_refresh_token: refresh-token-{ch}\n",
            ),
            ch = channel,
            i = i + 1,
        );
        std::fs::write(config_dir.path().join(format!("{channel}.yaml")), config).unwrap();
    }

    let config = Config::try_parse_from([
        "reelforge-conductor",
        "--database-url",
        "sqlite::memory:",
        "--workspace-root",
        workspace_dir.path().to_str().unwrap(),
        "--channel-config-dir",
        config_dir.path().to_str().unwrap(),
        "--scripts-dir",
        scripts_dir.path().to_str().unwrap(),
        "--webhook-secret",
        WEBHOOK_SECRET,
    ])
    .unwrap();

    let pool = reelforge_db::open_memory().await.unwrap();
    let vault = Vault::from_key_bytes(&[7u8; 32]).unwrap();
    let planning = Arc::new(FakePlanning::default());
    let uploader = Arc::new(FakeUploader::default());
    let oauth = OauthCache::new(OauthConfig {
        token_url: "http://127.0.0.1:1/token".into(),
        client_id: "test".into(),
        client_secret: "test".into(),
    })
    .unwrap();
    let alerts = Arc::new(WebhookAlertSink::new(None));

    let ctx = AppContext::new(
        pool,
        &config,
        vault,
        Arc::new(RateGate::planning()),
        planning.clone(),
        uploader.clone(),
        oauth,
        alerts,
    );
    ctx.registry.reload(&ctx.pool, &ctx.vault).await.unwrap();

    for channel in channels {
        ctx.oauth
            .seed(channel, "access-token", Utc::now() + ChronoDuration::hours(1))
            .await;
    }

    Harness {
        ctx,
        planning,
        uploader,
        workspace_dir,
        scripts_dir,
        config_dir,
    }
}

impl Harness {
    /// Claim one task and run the engine until it parks or terminates.
    /// Returns the task's row afterwards, or `None` if nothing was
    /// claimable.
    pub async fn drive_one(&self) -> Option<TaskRow> {
        let blocked = self.ctx.registry.upload_blocked();
        let task = queue::claim_next(&self.ctx.pool, "test-worker", &blocked)
            .await
            .unwrap()?;
        let id = task.id.clone();
        engine::run_claimed_task(&self.ctx, task).await.unwrap();
        tasks::get_task(&self.ctx.pool, &id).await.unwrap()
    }

    pub fn workspace(&self, task: &TaskRow) -> ProjectWorkspace {
        ProjectWorkspace::new(
            self.workspace_dir.path(),
            &task.channel_id,
            &task.id,
        )
    }

    /// Create all expected output files for the given stage indexes, so a
    /// task can be positioned mid-pipeline without running earlier stages.
    pub fn materialize_outputs(&self, task: &TaskRow, stages: &[u8]) {
        let ws = self.workspace(task);
        ws.ensure_dirs().unwrap();
        for stage in stages {
            for path in ws.stage_outputs(*stage) {
                std::fs::write(path, b"materialized").unwrap();
            }
        }
    }

    /// Labels mirrored so far, in push order.
    pub fn mirrored_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        while let Some(post) = self.ctx.mirror.pop() {
            labels.push(post.label.as_str().to_string());
        }
        labels
    }
}
