//! Planning-database client.
//!
//! A thin, rate-gated wrapper over the planning API's JSON surface. The
//! trait seam exists so the engine and reconciler can be driven against a
//! fake in tests; `HttpPlanningClient` is the production implementation.

use crate::error::ClientError;
use crate::rate_limit::RateGate;
use crate::retry::retry_request;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelforge_protocol::StatusLabel;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of the planning database, as seen by the inbound poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStatus {
    pub page_ref: String,
    pub title: String,
    pub topic: String,
    pub story_direction: String,
    pub priority_label: Option<String>,
    pub status_label: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlanningApi: Send + Sync {
    /// Mirror a status label (and optional error summary) onto a page.
    async fn update_status(
        &self,
        token: &str,
        page_ref: &str,
        label: StatusLabel,
        error_summary: Option<&str>,
    ) -> Result<(), ClientError>;

    /// Pages edited since `since` in one channel's database.
    async fn query_recent(
        &self,
        token: &str,
        database_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageStatus>, ClientError>;

    /// Write the published video URL back onto the page.
    async fn write_upload_url(
        &self,
        token: &str,
        page_ref: &str,
        url: &str,
    ) -> Result<(), ClientError>;
}

pub struct HttpPlanningClient {
    http: reqwest::Client,
    base_url: String,
    gate: Arc<RateGate>,
}

impl HttpPlanningClient {
    pub fn new(base_url: impl Into<String>, gate: Arc<RateGate>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate,
        })
    }

    async fn patch_page(
        &self,
        token: &str,
        page_ref: &str,
        properties: Value,
    ) -> Result<(), ClientError> {
        self.gate.acquire().await;
        let url = format!("{}/v1/pages/{}", self.base_url, page_ref);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(&json!({ "properties": properties }))
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body: truncate(&body, 512),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[async_trait]
impl PlanningApi for HttpPlanningClient {
    async fn update_status(
        &self,
        token: &str,
        page_ref: &str,
        label: StatusLabel,
        error_summary: Option<&str>,
    ) -> Result<(), ClientError> {
        debug!(page = page_ref, label = %label, "mirroring status");
        let mut properties = json!({
            "Status": { "select": { "name": label.as_str() } },
        });
        if let Some(summary) = error_summary {
            properties["Error"] = json!({
                "rich_text": [{ "text": { "content": truncate(summary, 1900) } }],
            });
        }
        retry_request("planning.update_status", || {
            self.patch_page(token, page_ref, properties.clone())
        })
        .await
    }

    async fn query_recent(
        &self,
        token: &str,
        database_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PageStatus>, ClientError> {
        let body = match since {
            Some(ts) => json!({
                "filter": {
                    "timestamp": "last_edited_time",
                    "last_edited_time": { "on_or_after": ts.to_rfc3339() },
                },
                "sorts": [{ "timestamp": "last_edited_time", "direction": "ascending" }],
            }),
            None => json!({
                "sorts": [{ "timestamp": "last_edited_time", "direction": "ascending" }],
            }),
        };

        let value = retry_request("planning.query_recent", || async {
            self.gate.acquire().await;
            let url = format!("{}/v1/databases/{}/query", self.base_url, database_id);
            let response = self
                .http
                .post(&url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .map_err(ClientError::from_reqwest)?;
            let response = check_status(response).await?;
            response
                .json::<Value>()
                .await
                .map_err(ClientError::from_reqwest)
        })
        .await?;

        let results = value
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::Parse("query response missing 'results'".into()))?;

        let mut pages = Vec::with_capacity(results.len());
        for page in results {
            pages.push(parse_page(page)?);
        }
        Ok(pages)
    }

    async fn write_upload_url(
        &self,
        token: &str,
        page_ref: &str,
        url: &str,
    ) -> Result<(), ClientError> {
        let properties = json!({
            "Video URL": { "url": url },
        });
        retry_request("planning.write_upload_url", || {
            self.patch_page(token, page_ref, properties.clone())
        })
        .await
    }
}

/// Decode one page object into a `PageStatus`.
fn parse_page(page: &Value) -> Result<PageStatus, ClientError> {
    let page_ref = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Parse("page missing 'id'".into()))?
        .to_string();

    let updated_at = page
        .get("last_edited_time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ClientError::Parse("page missing 'last_edited_time'".into()))?;

    let props = page.get("properties").cloned().unwrap_or_else(|| json!({}));

    Ok(PageStatus {
        page_ref,
        title: title_text(&props, "Title"),
        topic: rich_text(&props, "Topic"),
        story_direction: rich_text(&props, "Story Direction"),
        priority_label: select_name(&props, "Priority"),
        status_label: select_name(&props, "Status"),
        updated_at,
    })
}

fn select_name(props: &Value, name: &str) -> Option<String> {
    props
        .get(name)
        .and_then(|p| p.get("select"))
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn rich_text(props: &Value, name: &str) -> String {
    concat_text(props.get(name).and_then(|p| p.get("rich_text")))
}

fn title_text(props: &Value, name: &str) -> String {
    concat_text(props.get(name).and_then(|p| p.get("title")))
}

fn concat_text(fragments: Option<&Value>) -> String {
    fragments
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| {
                    part.get("text")
                        .and_then(|t| t.get("content"))
                        .and_then(Value::as_str)
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
