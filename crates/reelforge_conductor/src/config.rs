//! Process configuration.
//!
//! Everything comes from flags or environment variables; the encryption key
//! is read separately by the vault so it never passes through clap.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "reelforge-conductor", about = "Reelforge pipeline orchestrator")]
pub struct Config {
    /// Relational store DSN (SQLite path or sqlite: URL)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Filesystem root for per-project workspaces
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "./workspace")]
    pub workspace_root: PathBuf,

    /// Directory holding one YAML file per channel
    #[arg(long, env = "CHANNEL_CONFIG_DIR", default_value = "./channel_configs")]
    pub channel_config_dir: PathBuf,

    /// Directory holding the external pipeline programs
    #[arg(long, env = "SCRIPTS_DIR", default_value = "./scripts")]
    pub scripts_dir: PathBuf,

    /// HMAC secret for inbound webhook signatures
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Alert sink; absent degrades alerts to log-only
    #[arg(long, env = "ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,

    /// Planning database API base URL
    #[arg(long, env = "PLANNING_API_URL", default_value = "https://api.notion.com")]
    pub planning_api_url: String,

    /// Upload API base URL
    #[arg(
        long,
        env = "UPLOAD_API_URL",
        default_value = "https://www.googleapis.com/upload/youtube/v3"
    )]
    pub upload_api_url: String,

    /// OAuth token endpoint for upload-credential refresh
    #[arg(
        long,
        env = "OAUTH_TOKEN_URL",
        default_value = "https://oauth2.googleapis.com/token"
    )]
    pub oauth_token_url: String,

    #[arg(long, env = "OAUTH_CLIENT_ID", default_value = "")]
    pub oauth_client_id: String,

    #[arg(long, env = "OAUTH_CLIENT_SECRET", hide_env_values = true, default_value = "")]
    pub oauth_client_secret: String,

    /// Bind address for the control surface
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:8080")]
    pub http_addr: String,

    /// Lightweight workers in this process
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Dispatcher poll interval, seconds
    #[arg(long, default_value_t = 2)]
    pub poll_interval_secs: u64,

    /// Inbound planning-database poll interval, seconds
    #[arg(long, default_value_t = 60)]
    pub sync_poll_secs: u64,

    /// Verbose console logging
    #[arg(short, long)]
    pub verbose: bool,
}
