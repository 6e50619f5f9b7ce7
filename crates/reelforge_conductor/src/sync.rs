//! Bidirectional sync with the planning database.
//!
//! Outbound: every task state transition queues a mirror post; one loop
//! drains the queue through the rate-gated client with per-task
//! monotonicity. A post the retry classification marks terminal is recorded
//! in the audit log and dropped - it never blocks the task.
//!
//! Inbound: a 60 s poll (plus webhook nudges) turns user-driven label
//! changes into enqueues and review records. The internal store stays the
//! source of truth; inbound observations never overwrite internal state.

use crate::context::AppContext;
use crate::db::{audit, observations, tasks};
use crate::engine;
use crate::metrics::METRICS;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reelforge_clients::{PageStatus, PlanningApi};
use reelforge_protocol::{Priority, ReviewDecision, StatusLabel, TaskState};
use reelforge_vault::CredentialKind;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How far back the first poll of a channel looks.
const INITIAL_LOOKBACK_MINUTES: i64 = 10;

/// One outbound status mirror.
#[derive(Debug, Clone)]
pub struct MirrorPost {
    pub task_id: String,
    pub channel_id: String,
    pub page_ref: String,
    pub label: StatusLabel,
    pub error_summary: Option<String>,
    pub posted_at: DateTime<Utc>,
}

/// In-memory buffer between the engine and the mirror loop. Best-effort
/// ordering per task; the rate gate smooths the global request rate.
pub struct MirrorQueue {
    queue: Mutex<VecDeque<MirrorPost>>,
    notify: Notify,
}

impl MirrorQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, post: MirrorPost) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(post);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<MirrorPost> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    pub fn depth(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn nudge(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

impl Default for MirrorQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the mirror queue until shutdown.
pub async fn run_mirror_loop(ctx: &AppContext) {
    loop {
        if ctx.is_shutting_down() && ctx.mirror.depth() == 0 {
            return;
        }
        match ctx.mirror.pop() {
            Some(post) => {
                if let Err(err) = deliver_post(ctx, &post).await {
                    warn!(task = %post.task_id, error = %err, "mirror post dropped");
                }
            }
            None => ctx.mirror.wait(Duration::from_millis(500)).await,
        }
    }
}

async fn deliver_post(ctx: &AppContext, post: &MirrorPost) -> Result<()> {
    // Monotonicity: skip posts older than what the page already shows.
    if let Some(task) = tasks::get_task(&ctx.pool, &post.task_id).await? {
        if let Some(mirrored_at) = &task.mirrored_at {
            if crate::db::parse_ts(mirrored_at) > post.posted_at {
                debug!(task = %post.task_id, label = %post.label, "skipping stale mirror post");
                return Ok(());
            }
        }
    }

    let token = match ctx
        .credential(&post.channel_id, CredentialKind::PlanningToken)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            METRICS.inc(&METRICS.mirror_failures);
            audit::append(
                &ctx.pool,
                Some(&post.channel_id),
                Some(&post.task_id),
                audit::actions::MIRROR_DROPPED,
                "system",
                Some("planning credential unavailable"),
                &json!({"label": post.label.as_str()}),
            )
            .await?;
            return Err(err);
        }
    };

    let result = ctx
        .planning
        .update_status(
            &token,
            &post.page_ref,
            post.label,
            post.error_summary.as_deref(),
        )
        .await;

    match result {
        Ok(()) => {
            METRICS.inc(&METRICS.mirror_posts);
            tasks::update_mirror_stamp(&ctx.pool, &post.task_id, post.label.as_str(), post.posted_at)
                .await?;
            Ok(())
        }
        Err(err) => {
            // The client already retried transient failures; anything that
            // reaches here is dropped without blocking the task.
            METRICS.inc(&METRICS.mirror_failures);
            audit::append(
                &ctx.pool,
                Some(&post.channel_id),
                Some(&post.task_id),
                audit::actions::MIRROR_DROPPED,
                "system",
                Some(&err.to_string()),
                &json!({"label": post.label.as_str()}),
            )
            .await?;
            Err(err.into())
        }
    }
}

/// Inbound poll loop: every `sync_poll` interval, fetch recently edited
/// pages per active channel.
pub async fn run_poll_loop(ctx: &AppContext) {
    let mut cursors: HashMap<String, DateTime<Utc>> = HashMap::new();
    loop {
        if ctx.is_shutting_down() {
            return;
        }
        if let Err(err) = poll_once(ctx, &mut cursors).await {
            warn!(error = %err, "inbound poll failed");
        }
        tokio::time::sleep(ctx.sync_poll).await;
    }
}

/// One poll pass over every active channel.
pub async fn poll_once(
    ctx: &AppContext,
    cursors: &mut HashMap<String, DateTime<Utc>>,
) -> Result<()> {
    for config in ctx.registry.active_channels() {
        let channel_id = config.channel_id.to_string();
        let token = match ctx
            .credential(&channel_id, CredentialKind::PlanningToken)
            .await
        {
            Ok(token) => token,
            Err(err) => {
                debug!(channel = %channel_id, error = %err, "skipping poll: no planning credential");
                continue;
            }
        };

        let since = cursors
            .get(&channel_id)
            .copied()
            .unwrap_or_else(|| Utc::now() - ChronoDuration::minutes(INITIAL_LOOKBACK_MINUTES));

        let pages = match ctx
            .planning
            .query_recent(&token, &config.planning_db_database_id, Some(since))
            .await
        {
            Ok(pages) => pages,
            Err(err) => {
                warn!(channel = %channel_id, error = %err, "poll query failed");
                continue;
            }
        };

        let mut newest = since;
        for page in &pages {
            if page.updated_at > newest {
                newest = page.updated_at;
            }
            if let Err(err) = process_observation(ctx, &channel_id, page).await {
                warn!(channel = %channel_id, page = %page.page_ref, error = %err, "observation failed");
            }
        }
        cursors.insert(channel_id, newest);
    }
    Ok(())
}

/// Apply one inbound page observation. Idempotent on
/// `(page, label, updated_at)`.
pub async fn process_observation(
    ctx: &AppContext,
    channel_id: &str,
    page: &PageStatus,
) -> Result<()> {
    let Some(label_text) = page.status_label.as_deref() else {
        return Ok(());
    };
    let updated_at = page.updated_at.to_rfc3339();

    if observations::already_seen(&ctx.pool, channel_id, &page.page_ref, label_text, &updated_at)
        .await?
    {
        return Ok(());
    }

    let label = StatusLabel::parse(label_text);
    match label {
        Some(StatusLabel::Queued) => {
            intake_queued_page(ctx, channel_id, page).await?;
        }
        Some(
            StatusLabel::AssetsApproved
            | StatusLabel::VideoApproved
            | StatusLabel::AudioApproved
            | StatusLabel::Approved,
        ) => {
            intake_review(ctx, channel_id, page, ReviewDecision::Approved).await?;
        }
        Some(label) if label.is_error() => {
            // A user flipping an awaiting-review page to its error label is
            // the planning-side rejection gesture.
            intake_review(ctx, channel_id, page, ReviewDecision::Rejected).await?;
        }
        _ => {
            debug!(page = %page.page_ref, label = label_text, "ignoring inbound label");
        }
    }

    observations::record(&ctx.pool, channel_id, &page.page_ref, label_text, &updated_at).await?;
    METRICS.inc(&METRICS.inbound_observations);
    Ok(())
}

/// `Queued` on a page: enqueue it, or re-enqueue a fresh attempt of an
/// errored task from its last completed stage.
async fn intake_queued_page(ctx: &AppContext, channel_id: &str, page: &PageStatus) -> Result<()> {
    if tasks::live_task_for_page(&ctx.pool, channel_id, &page.page_ref)
        .await?
        .is_some()
    {
        return Ok(());
    }

    let prior = tasks::latest_task_for_page(&ctx.pool, channel_id, &page.page_ref).await?;
    let task = match prior {
        Some(prior)
            if matches!(prior.task_state(), TaskState::Failed | TaskState::Rejected) =>
        {
            info!(page = %page.page_ref, "user requeued errored page; new attempt");
            tasks::enqueue_retry_attempt(&ctx.pool, &prior).await?
        }
        _ => {
            let new = tasks::NewTask {
                channel_id: channel_id.to_string(),
                planning_page_ref: page.page_ref.clone(),
                title: if page.title.is_empty() {
                    page.page_ref.clone()
                } else {
                    page.title.clone()
                },
                topic: page.topic.clone(),
                story_direction: page.story_direction.clone(),
                priority: page
                    .priority_label
                    .as_deref()
                    .and_then(Priority::parse_label)
                    .unwrap_or_default(),
            };
            tasks::enqueue(&ctx.pool, &new).await?
        }
    };

    info!(task = %task.id, page = %page.page_ref, "task enqueued from planning database");
    ctx.wake.notify_waiters();
    Ok(())
}

async fn intake_review(
    ctx: &AppContext,
    channel_id: &str,
    page: &PageStatus,
    decision: ReviewDecision,
) -> Result<()> {
    let Some(task) = tasks::live_task_for_page(&ctx.pool, channel_id, &page.page_ref).await? else {
        return Ok(());
    };
    if task.task_state() != TaskState::AwaitingReview {
        return Ok(());
    }

    let result = engine::apply_review_decision(
        ctx,
        &task.id,
        decision,
        "planning-db",
        Some("decision recorded via planning database"),
    )
    .await;
    if let Err(err) = result {
        // A concurrent HTTP decision already closed the gate; that's fine.
        debug!(task = %task.id, error = %err, "inbound review not applied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_queue_is_fifo() {
        let queue = MirrorQueue::new();
        for label in [StatusLabel::Queued, StatusLabel::Claimed] {
            queue.push(MirrorPost {
                task_id: "t1".into(),
                channel_id: "alpha".into(),
                page_ref: "p1".into(),
                label,
                error_summary: None,
                posted_at: Utc::now(),
            });
        }
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.pop().unwrap().label, StatusLabel::Queued);
        assert_eq!(queue.pop().unwrap().label, StatusLabel::Claimed);
        assert!(queue.pop().is_none());
    }
}
