//! Control-surface tests driven through the router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{harness, Harness, WEBHOOK_SECRET};
use hmac::{Hmac, Mac};
use reelforge_conductor::db::tasks;
use reelforge_conductor::http::build_router;
use reelforge_protocol::Priority;
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

fn sign(body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
    let router = build_router(h.ctx.clone());
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn webhook_request(body: &str, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/planning-db")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-notion-signature", signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn queued_event(page: &str) -> String {
    json!({
        "channel_id": "alpha",
        "page_ref": page,
        "status_label": "Queued",
        "updated_at": "2026-02-01T10:00:00Z",
        "title": "Webhook video",
        "topic": "geysers",
        "priority": "High",
    })
    .to_string()
}

fn enqueue_request(channel: &str, page: &str) -> tasks::NewTask {
    tasks::NewTask {
        channel_id: channel.to_string(),
        planning_page_ref: page.to_string(),
        title: "t".to_string(),
        topic: String::new(),
        story_direction: String::new(),
        priority: Priority::Normal,
    }
}

#[tokio::test]
async fn health_reports_database_and_queue() {
    let h = harness().await;
    tasks::enqueue(&h.ctx.pool, &enqueue_request("alpha", "p1"))
        .await
        .unwrap();

    let (status, body) = send(
        &h,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database_reachable"], true);
    assert_eq!(body["queue_depth"], 1);
}

#[tokio::test]
async fn webhook_rejects_bad_signature_without_mutation() {
    let h = harness().await;
    let body = queued_event("page-w1");

    // Missing header.
    let (status, detail) = send(&h, webhook_request(&body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(detail["detail"].as_str().unwrap().contains("signature"));

    // Wrong signature.
    let (status, _) = send(&h, webhook_request(&body, Some("deadbeef"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // B3: nothing was parsed, no task exists.
    let rows = tasks::list_tasks(&h.ctx.pool, None, None, 10).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn webhook_enqueues_and_replay_is_idempotent() {
    let h = harness().await;
    let body = queued_event("page-w1");
    let signature = sign(&body);

    let (status, _) = send(&h, webhook_request(&body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);

    let rows = tasks::list_tasks(&h.ctx.pool, Some("alpha"), None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "Webhook video");
    assert_eq!(rows[0].priority_level(), Priority::High);

    // L3: same payload, same signature, no additional state change.
    let (status, _) = send(&h, webhook_request(&body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    let rows = tasks::list_tasks(&h.ctx.pool, Some("alpha"), None, 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn webhook_verification_handshake_echoes_token() {
    let h = harness().await;
    let body = json!({"verification_token": "vtok-123"}).to_string();
    let signature = sign(&body);

    let (status, value) = send(&h, webhook_request(&body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["verification_token"], "vtok-123");

    let stored: String =
        sqlx::query_scalar("SELECT verification_token FROM webhook_tokens ORDER BY id DESC LIMIT 1")
            .fetch_one(&h.ctx.pool)
            .await
            .unwrap();
    assert_eq!(stored, "vtok-123");
}

#[tokio::test]
async fn approve_endpoint_respects_gate_state() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &enqueue_request("alpha", "p1"))
        .await
        .unwrap();

    // Not awaiting review yet: conflict.
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{}/approve", task.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({"reviewer": "sam"}).to_string()))
        .unwrap();
    let (status, _) = send(&h, request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Park the task at the assets gate, then approve over HTTP.
    h.drive_one().await.unwrap();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{}/approve", task.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({"reviewer": "sam"}).to_string()))
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "approved");

    let row = tasks::get_task(&h.ctx.pool, &task.id).await.unwrap().unwrap();
    assert_eq!(row.state, "approved");
    assert_eq!(row.stage_index, 1);

    // Unknown task: 404.
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks/00000000-0000-0000-0000-000000000000/approve")
        .header("content-type", "application/json")
        .body(Body::from(json!({"reviewer": "sam"}).to_string()))
        .unwrap();
    let (status, _) = send(&h, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_endpoint_requires_terminal_state() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &enqueue_request("alpha", "p1"))
        .await
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{}/retry", task.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({"actor": "sam"}).to_string()))
        .unwrap();
    let (status, _) = send(&h, request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    sqlx::query("UPDATE tasks SET state = 'failed' WHERE id = ?")
        .bind(&task.id)
        .execute(&h.ctx.pool)
        .await
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{}/retry", task.id))
        .header("content-type", "application/json")
        .body(Body::from(json!({"actor": "sam"}).to_string()))
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["retry_count"], 0);
}

#[tokio::test]
async fn task_projections_round_trip() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &enqueue_request("alpha", "p1"))
        .await
        .unwrap();

    let (status, list) = send(
        &h,
        Request::builder()
            .uri("/api/v1/tasks?channel=alpha&state=pending")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, detail) = send(
        &h,
        Request::builder()
            .uri(format!("/api/v1/tasks/{}", task.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["planning_page_ref"], "p1");
    assert_eq!(detail["completed_stages"], 0);

    let (status, _) = send(
        &h,
        Request::builder()
            .uri("/api/v1/tasks/missing-id")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, channels) = send(
        &h,
        Request::builder()
            .uri("/api/v1/channels")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let channels = channels.as_array().unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["channel_id"], "alpha");
    assert_eq!(channels[0]["daily_spend_usd"], "0.0000");

    // Unknown state filters are a 400, not a silent empty list.
    let (status, _) = send(
        &h,
        Request::builder()
            .uri("/api/v1/tasks?state=bogus")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
