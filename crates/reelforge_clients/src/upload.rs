//! Upload client.
//!
//! The billable path: before calling `upload_video` the engine reserves
//! units against the per-(channel, day) quota ledger in a short transaction;
//! this client only performs the API calls. The resumable two-step protocol
//! (session init, then byte upload) keeps metadata failures cheap.

use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Quota units one video upload consumes.
pub const UPLOAD_COST_UNITS: i64 = 1600;

/// Default daily ceiling when a channel does not configure one.
pub const DEFAULT_DAILY_CEILING: i64 = 10_000;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(1_200);

/// A published video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRef {
    pub video_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub title: String,
    pub description: String,
    /// `private`, `unlisted` or `public`.
    pub privacy: String,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_video(
        &self,
        access_token: &str,
        meta: &UploadMeta,
        file: &Path,
    ) -> Result<VideoRef, ClientError>;
}

pub struct HttpUploadClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .connect_timeout(INIT_TIMEOUT)
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Uploader for HttpUploadClient {
    async fn upload_video(
        &self,
        access_token: &str,
        meta: &UploadMeta,
        file: &Path,
    ) -> Result<VideoRef, ClientError> {
        // Step 1: open a resumable session with the metadata.
        let init_url = format!(
            "{}/upload/videos?uploadType=resumable&part=snippet,status",
            self.base_url
        );
        let body = json!({
            "snippet": {
                "title": meta.title,
                "description": meta.description,
            },
            "status": { "privacyStatus": meta.privacy },
        });
        let response = self
            .http
            .post(&init_url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let session_url = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::Parse("resumable init missing Location header".into()))?
            .to_string();

        // Step 2: stream the file into the session.
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| ClientError::Network(format!("read {}: {e}", file.display())))?;
        let response = self
            .http
            .put(&session_url)
            .bearer_auth(access_token)
            .header("content-type", "video/mp4")
            .body(bytes)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response.json().await.map_err(ClientError::from_reqwest)?;
        let video_id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Parse("upload response missing 'id'".into()))?
            .to_string();
        let url = format!("https://www.youtube.com/watch?v={video_id}");
        info!(video_id = %video_id, "upload complete");
        Ok(VideoRef { video_id, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_cost_matches_the_ledger_contract() {
        // One upload must fit twice into the default ceiling with room for
        // the 80% warning band in between.
        assert_eq!(UPLOAD_COST_UNITS, 1600);
        assert!(UPLOAD_COST_UNITS * 2 < DEFAULT_DAILY_CEILING);
    }
}
