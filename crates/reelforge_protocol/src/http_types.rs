//! Request/response types for the HTTP control surface.
//!
//! JSON with snake_case fields, ISO-8601 timestamps, integers for counts and
//! strings for monetary values (four decimal places, see `format_usd`).

use crate::error::ErrorLog;
use crate::task::{Priority, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database_reachable: bool,
    pub queue_depth: i64,
    pub in_flight: i64,
    pub workers: Vec<WorkerHeartbeat>,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub busy: bool,
}

/// Metrics counters embedded in the health response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub leases_resurrected: u64,
    pub mirror_posts: u64,
    pub mirror_failures: u64,
    pub rate_gate_waits: u64,
}

/// `GET /api/v1/channels` element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub channel_name: String,
    pub is_active: bool,
    pub priority_weight: i64,
    pub max_concurrent: i64,
    pub in_flight: i64,
    pub daily_spend_cap_usd: Option<String>,
    pub daily_spend_usd: String,
}

/// `GET /api/v1/tasks` element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    pub priority: Priority,
    pub state: TaskState,
    pub stage_index: u8,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `GET /api/v1/tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub planning_page_ref: String,
    pub topic: String,
    pub story_direction: String,
    pub completed_stages: u32,
    pub attempt: i64,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error_log: Option<ErrorLog>,
    pub correlation_id: String,
}

/// `GET /api/v1/tasks/{id}/costs` element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntryView {
    pub component: String,
    pub units: f64,
    pub usd_cost: String,
    pub api_calls: i64,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/v1/tasks/{id}/approve` and `/reject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecisionRequest {
    pub reviewer: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Body of `POST /api/v1/tasks/{id}/retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRequest {
    pub actor: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Error body: `{"detail": "<message>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_shape() {
        let body = serde_json::to_value(ErrorResponse::new("missing signature")).unwrap();
        assert_eq!(body, serde_json::json!({"detail": "missing signature"}));
    }

    #[test]
    fn review_request_note_is_optional() {
        let req: ReviewDecisionRequest =
            serde_json::from_str(r#"{"reviewer": "sam"}"#).unwrap();
        assert_eq!(req.reviewer, "sam");
        assert!(req.note.is_none());
    }
}
