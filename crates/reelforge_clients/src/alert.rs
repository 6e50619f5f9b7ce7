//! Outbound alert dispatch.
//!
//! One abstract sink; the default implementation posts JSON to a configured
//! webhook and degrades to log-only when no URL is set. Alert delivery is
//! best-effort by contract: a failed post never propagates to the caller.

use async_trait::async_trait;
use reelforge_protocol::{Alert, AlertSeverity};
use std::time::Duration;
use tracing::{error, warn};

const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn post(&self, alert: Alert);
}

pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: Option<String>,
}

impl WebhookAlertSink {
    /// `url` comes from `ALERT_WEBHOOK_URL`; `None` degrades to log-only.
    pub fn new(url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, url }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn post(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Warning => {
                warn!(summary = %alert.summary, context = %alert.context, "alert")
            }
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(severity = %alert.severity, summary = %alert.summary, context = %alert.context, "alert")
            }
        }

        let Some(url) = &self.url else {
            return;
        };

        let result = self.http.post(url).json(&alert).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    status = response.status().as_u16(),
                    "alert webhook rejected the post"
                );
            }
            Err(err) => {
                warn!(error = %err, "alert webhook unreachable");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn log_only_sink_never_fails() {
        let sink = WebhookAlertSink::new(None);
        sink.post(Alert::new(
            AlertSeverity::Warning,
            "quota at 80%",
            json!({"channel": "alpha"}),
        ))
        .await;
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        let sink = WebhookAlertSink::new(Some("http://127.0.0.1:1/hook".into()));
        sink.post(Alert::new(
            AlertSeverity::Critical,
            "database unreachable",
            json!({}),
        ))
        .await;
    }
}
