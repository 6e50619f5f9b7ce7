//! HTTP control surface.
//!
//! Small JSON API: health, webhook ingestion (HMAC-verified before the body
//! is parsed), review decisions, manual retry and read projections. Heavy
//! work never happens in a handler; webhook events become inbound
//! observations and a reconciler nudge.

use crate::context::AppContext;
use crate::db::{channels, costs, tasks};
use crate::engine::{self, ControlError};
use crate::metrics::METRICS;
use crate::sync;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reelforge_clients::PageStatus;
use reelforge_protocol::http_types::{
    CostEntryView, ErrorResponse, HealthResponse, RetryRequest, ReviewDecisionRequest,
    TaskDetail, TaskSummary, WorkerHeartbeat,
};
use reelforge_protocol::{ChannelSummary, ReviewDecision, TaskState};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/planning-db", post(webhook))
        .route("/api/v1/tasks/{id}/approve", post(approve))
        .route("/api/v1/tasks/{id}/reject", post(reject))
        .route("/api/v1/tasks/{id}/retry", post(retry))
        .route("/api/v1/tasks/{id}/costs", get(task_costs))
        .route("/api/v1/tasks/{id}", get(task_detail))
        .route("/api/v1/tasks", get(task_list))
        .route("/api/v1/channels", get(channel_list))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, d),
            ApiError::Unauthorized(d) => (StatusCode::UNAUTHORIZED, d),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d),
            ApiError::Conflict(d) => (StatusCode::CONFLICT, d),
            ApiError::Unavailable(d) => (StatusCode::SERVICE_UNAVAILABLE, d),
            ApiError::Internal(d) => (StatusCode::INTERNAL_SERVER_ERROR, d),
        };
        (status, Json(ErrorResponse::new(detail))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ControlError>() {
            Some(ControlError::TaskNotFound(_)) => ApiError::NotFound(err.to_string()),
            Some(ControlError::GateClosed(_)) => ApiError::Conflict(err.to_string()),
            Some(ControlError::NotTerminal(_)) => ApiError::Conflict(err.to_string()),
            None => ApiError::Internal(err.to_string()),
        }
    }
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Result<Json<HealthResponse>, ApiError> {
    let database_reachable = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&ctx.pool)
        .await
        .is_ok();

    let (queue_depth, in_flight) = if database_reachable {
        (
            tasks::queue_depth(&ctx.pool).await.unwrap_or(0),
            tasks::in_flight_total(&ctx.pool).await.unwrap_or(0),
        )
    } else {
        (0, 0)
    };

    let workers = ctx
        .worker_board()
        .into_iter()
        .map(|(worker_id, hb)| WorkerHeartbeat {
            worker_id,
            last_seen: hb.last_seen,
            busy: hb.busy,
        })
        .collect();

    Ok(Json(HealthResponse {
        status: (if database_reachable { "ok" } else { "degraded" }).to_string(),
        database_reachable,
        queue_depth,
        in_flight,
        workers,
        counters: METRICS.snapshot(ctx.rate_gate.waited_total()),
    }))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    verification_token: Option<String>,
    channel_id: Option<String>,
    page_ref: Option<String>,
    status_label: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    story_direction: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

/// `POST /webhook/planning-db`. The signature is verified against the raw
/// body before any parsing happens.
async fn webhook(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(secret) = &ctx.webhook_secret else {
        return Err(ApiError::Unavailable("webhook ingestion not configured".into()));
    };

    let signature = headers
        .get("x-notion-signature")
        .or_else(|| headers.get("x-signature"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing signature header".into()))?;

    verify_signature(secret.as_bytes(), &body, signature)?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid payload: {e}")))?;

    // One-time verification handshake: store the token and echo it back.
    if let Some(token) = event.verification_token {
        sqlx::query("INSERT INTO webhook_tokens (verification_token, created_at) VALUES (?, ?)")
            .bind(&token)
            .bind(crate::db::now_rfc3339())
            .execute(&ctx.pool)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        info!("webhook verification token stored");
        return Ok(Json(json!({"verification_token": token})));
    }

    let (channel_id, page_ref, updated_at) = match (
        event.channel_id.as_deref(),
        event.page_ref.as_deref(),
        event.updated_at,
    ) {
        (Some(channel), Some(page), Some(updated_at)) => (channel, page, updated_at),
        _ => {
            return Err(ApiError::BadRequest(
                "event requires channel_id, page_ref and updated_at".into(),
            ))
        }
    };

    let page = PageStatus {
        page_ref: page_ref.to_string(),
        title: event.title.unwrap_or_default(),
        topic: event.topic.unwrap_or_default(),
        story_direction: event.story_direction.unwrap_or_default(),
        priority_label: event.priority,
        status_label: event.status_label,
        updated_at,
    };
    sync::process_observation(&ctx, channel_id, &page)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(json!({"ok": true})))
}

/// Constant-time HMAC-SHA256 verification of the raw body.
fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> Result<(), ApiError> {
    let hex_part = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided_bytes = hex::decode(hex_part.trim())
        .map_err(|_| ApiError::Unauthorized("malformed signature".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| ApiError::Internal("webhook secret unusable".into()))?;
    mac.update(body);
    mac.verify_slice(&provided_bytes)
        .map_err(|_| ApiError::Unauthorized("signature mismatch".into()))
}

async fn approve(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(request): Json<ReviewDecisionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine::apply_review_decision(
        &ctx,
        &id,
        ReviewDecision::Approved,
        &request.reviewer,
        request.note.as_deref(),
    )
    .await?;
    Ok(Json(json!({"task_id": id, "decision": "approved"})))
}

async fn reject(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(request): Json<ReviewDecisionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine::apply_review_decision(
        &ctx,
        &id,
        ReviewDecision::Rejected,
        &request.reviewer,
        request.note.as_deref(),
    )
    .await?;
    Ok(Json(json!({"task_id": id, "decision": "rejected"})))
}

async fn retry(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<TaskSummary>, ApiError> {
    let task = engine::perform_manual_retry(&ctx, &id, &request.actor, request.note.as_deref())
        .await?;
    Ok(Json(task.summary()))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    channel: Option<String>,
    state: Option<String>,
    limit: Option<i64>,
}

async fn task_list(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let state = match query.state.as_deref() {
        None => None,
        Some(raw) => Some(
            TaskState::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown state {raw:?}")))?,
        ),
    };
    let rows = tasks::list_tasks(
        &ctx.pool,
        query.channel.as_deref(),
        state,
        query.limit.unwrap_or(100).clamp(1, 1000),
    )
    .await
    .map_err(ApiError::from)?;
    Ok(Json(rows.iter().map(|r| r.summary()).collect()))
}

async fn task_detail(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, ApiError> {
    let task = tasks::get_task(&ctx.pool, &id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(Json(task.detail()))
}

async fn task_costs(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CostEntryView>>, ApiError> {
    if tasks::get_task(&ctx.pool, &id)
        .await
        .map_err(ApiError::from)?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("task {id} not found")));
    }
    let entries = costs::costs_for_task(&ctx.pool, &id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(entries.iter().map(|e| e.view()).collect()))
}

async fn channel_list(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<ChannelSummary>>, ApiError> {
    let rows = channels::list_channels(&ctx.pool)
        .await
        .map_err(ApiError::from)?;
    let today = crate::db::today_utc();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let in_flight = tasks::in_flight_for_channel(&ctx.pool, &row.channel_id)
            .await
            .unwrap_or(0);
        let spend = costs::daily_spend(&ctx.pool, &row.channel_id, &today)
            .await
            .unwrap_or(0.0);
        out.push(row.summary(in_flight, spend));
    }
    Ok(Json(out))
}
