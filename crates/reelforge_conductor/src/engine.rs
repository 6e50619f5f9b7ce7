//! Pipeline engine: drives one claimed task through its stages.
//!
//! The engine owns every retry-vs-terminal decision. Database writes happen
//! in short transactions strictly between suspensions; no handle is ever
//! held across a subprocess run or an outbound API call.

use crate::context::AppContext;
use crate::db::models::TaskRow;
use crate::db::{audit, costs, ledger, reviews, tasks};
use crate::metrics::METRICS;
use crate::stages::{self, StageFailure, StageOutput};
use crate::sync::MirrorPost;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use reelforge_clients::{UPLOAD_COST_UNITS, DEFAULT_DAILY_CEILING};
use reelforge_db::{with_tx, DbError};
use reelforge_protocol::labels::{
    gate_approved_label, gate_waiting_label, stage_done_label, stage_error_label,
    stage_start_label,
};
use reelforge_protocol::{
    has_stage, AlertSeverity, ErrorKind, ErrorLog, ReviewDecision, Stage, StatusLabel, TaskState,
};
use serde_json::json;
use tracing::{error, info, warn};

/// Task-level retry budget (distinct from the clients' 3-attempt loop).
pub const MAX_TASK_RETRIES: i64 = 5;

/// Backoff schedule across task attempts, in minutes.
const RETRY_SCHEDULE_MINUTES: [i64; 4] = [1, 5, 15, 60];

/// Delay before a stage blocked by infrastructure or reauth is retried.
const PARK_MINUTES: i64 = 5;

/// Backoff applied before attempt `retry_count` (1-based).
pub fn retry_backoff(retry_count: i64) -> ChronoDuration {
    let idx = (retry_count - 1).clamp(0, RETRY_SCHEDULE_MINUTES.len() as i64 - 1) as usize;
    ChronoDuration::minutes(RETRY_SCHEDULE_MINUTES[idx])
}

/// Drive a freshly claimed task until it parks (gate, retry, quota), fails,
/// or completes. The claim transition has already happened.
pub async fn run_claimed_task(ctx: &AppContext, task: TaskRow) -> Result<()> {
    let Some(config) = ctx.registry.get(&task.channel_id) else {
        // Channel disappeared between claim and execution; put the task back.
        warn!(task = %task.id, channel = %task.channel_id, "channel not in registry; re-parking task");
        let log = ErrorLog::new(
            task.stage_index as u8,
            ErrorKind::Infrastructure,
            "channel configuration unavailable",
            task.retry_count,
        );
        tasks::park_pending(&ctx.pool, &task.id, &log, Utc::now() + ChronoDuration::minutes(PARK_MINUTES))
            .await?;
        return Ok(());
    };

    // Daily spend cap: warn once at 80%, pause until the next UTC day at
    // 100%.
    if let Some(cap) = config.daily_spend_cap_usd {
        let today = crate::db::today_utc();
        let spend = costs::daily_spend(&ctx.pool, &task.channel_id, &today).await?;
        if spend >= cap * 0.8
            && spend < cap
            && ctx.first_spend_warning(&task.channel_id, &today)
        {
            ctx.alert(
                AlertSeverity::Warning,
                "channel daily spend at 80%",
                json!({"channel": task.channel_id, "spend": spend, "cap": cap}),
            )
            .await;
        }
        if spend >= cap {
            let log = ErrorLog::new(
                task.stage_index as u8,
                ErrorKind::Quota,
                format!("daily spend cap reached ({spend:.4} >= {cap:.4})"),
                task.retry_count,
            );
            tasks::park_pending(&ctx.pool, &task.id, &log, crate::db::next_utc_midnight()).await?;
            ctx.alert(
                AlertSeverity::Warning,
                "channel paused at daily spend cap",
                json!({"channel": task.channel_id, "task": task.id, "spend": spend, "cap": cap}),
            )
            .await;
            mirror(ctx, &task, StatusLabel::Queued, None);
            return Ok(());
        }
    }

    let mut task = reconcile_bitmap(ctx, task).await?;

    loop {
        if ctx.is_shutting_down() {
            // Cooperative shutdown between stages: persist and release.
            tasks::park_pending(
                &ctx.pool,
                &task.id,
                &ErrorLog::new(task.stage_index as u8, ErrorKind::Infrastructure, "shutdown", task.retry_count),
                Utc::now(),
            )
            .await?;
            return Ok(());
        }

        let stage = task.stage();

        if has_stage(task.bitmap(), stage) {
            match stage.next() {
                Some(next) => {
                    tasks::set_stage_index(&ctx.pool, &task.id, next.index() as i64).await?;
                    task = refetch(ctx, &task.id).await?;
                    continue;
                }
                None => {
                    // Every bit set: nothing left to do.
                    tasks::complete_task(&ctx.pool, &task.id).await?;
                    mirror(ctx, &task, StatusLabel::Published, None);
                    return Ok(());
                }
            }
        }

        // Upload quota is reserved before the billable call, in its own
        // short transaction.
        if stage == Stage::Upload {
            match reserve_upload_quota(ctx, &config.daily_spend_cap_usd, &task).await? {
                QuotaDecision::Proceed => {}
                QuotaDecision::Parked => return Ok(()),
            }
        }

        tasks::mark_stage_started(&ctx.pool, &task.id, stage).await?;
        // Finalize shares the upload stage's label; no second post.
        if stage != Stage::Finalize {
            mirror(ctx, &task, stage_start_label(stage), None);
        }
        info!(task = %task.id, stage = %stage, attempt = task.attempt, "stage started");

        let outcome = stages::execute_stage(ctx, &config, &task, stage).await;

        match outcome {
            Ok(output) => {
                finish_stage(ctx, &task, stage, &output).await?;
                METRICS.inc(&METRICS.stages_completed);

                let waiting = stage.gate_after().map(gate_waiting_label);
                if let Some(label) = stage_done_label(stage) {
                    if label != StatusLabel::Published && Some(label) != waiting {
                        mirror(ctx, &task, label, None);
                    }
                }

                if let Some(gate) = stage.gate_after() {
                    mirror(ctx, &task, gate_waiting_label(gate), None);
                    info!(task = %task.id, gate = %gate, "awaiting review");
                    return Ok(());
                }

                if stage == Stage::Finalize {
                    tasks::complete_task(&ctx.pool, &task.id).await?;
                    METRICS.inc(&METRICS.tasks_completed);
                    mirror(ctx, &task, StatusLabel::Published, None);
                    info!(task = %task.id, "task completed");
                    return Ok(());
                }

                task = refetch(ctx, &task.id).await?;
            }
            Err(failure) => {
                handle_stage_failure(ctx, &task, stage, failure).await?;
                return Ok(());
            }
        }
    }
}

enum QuotaDecision {
    Proceed,
    Parked,
}

async fn reserve_upload_quota(
    ctx: &AppContext,
    _spend_cap: &Option<f64>,
    task: &TaskRow,
) -> Result<QuotaDecision> {
    let today = crate::db::today_utc();
    let outcome = ledger::reserve_units(
        &ctx.pool,
        &task.channel_id,
        &today,
        UPLOAD_COST_UNITS,
        DEFAULT_DAILY_CEILING,
    )
    .await?;

    match outcome {
        ledger::QuotaOutcome::Reserved {
            used_after,
            ceiling,
            crossed_80,
        } => {
            if crossed_80 {
                ctx.alert(
                    AlertSeverity::Warning,
                    "upload quota at 80%",
                    json!({"channel": task.channel_id, "used": used_after, "ceiling": ceiling}),
                )
                .await;
            }
            Ok(QuotaDecision::Proceed)
        }
        ledger::QuotaOutcome::Exhausted { used, ceiling } => {
            let log = ErrorLog::new(
                Stage::Upload.index(),
                ErrorKind::Quota,
                format!("upload quota exhausted ({used}/{ceiling})"),
                task.retry_count,
            );
            tasks::park_pending(&ctx.pool, &task.id, &log, crate::db::next_utc_midnight()).await?;
            mirror(ctx, task, StatusLabel::Queued, None);
            info!(task = %task.id, used, ceiling, "upload parked until next UTC day");
            Ok(QuotaDecision::Parked)
        }
    }
}

/// Stage-end bookkeeping in one short transaction: stage bit, cost entry
/// and, for the upload stage, the published URL.
async fn finish_stage(
    ctx: &AppContext,
    task: &TaskRow,
    stage: Stage,
    output: &StageOutput,
) -> Result<()> {
    let park = stage.gate_after().is_some();
    let task_snapshot = task.clone();
    let cost = output.cost.clone();
    let video = output.video.clone();

    with_tx::<_, anyhow::Error, _>(&ctx.pool, move |conn| {
        Box::pin(async move {
            tasks::tx_finish_stage(conn, &task_snapshot, stage, park)
                .await
                .map_err(DbError::from)?;
            costs::tx_record_cost(
                conn,
                &task_snapshot.id,
                &task_snapshot.channel_id,
                stage.cost_component(),
                cost.units,
                cost.usd,
                cost.api_calls,
                &cost.metadata,
            )
            .await
            .map_err(DbError::from)?;
            if let Some(video) = &video {
                tasks::tx_set_video_url(conn, &task_snapshot.id, &video.url)
                    .await
                    .map_err(DbError::from)?;
            }
            Ok(())
        })
    })
    .await
}

/// The single retry-vs-terminal decision point.
async fn handle_stage_failure(
    ctx: &AppContext,
    task: &TaskRow,
    stage: Stage,
    failure: StageFailure,
) -> Result<()> {
    warn!(task = %task.id, stage = %stage, kind = %failure.kind, "stage failed: {}", failure.message);

    match failure.kind {
        ErrorKind::Quota => {
            let log = ErrorLog::new(stage.index(), failure.kind, &failure.message, task.retry_count);
            tasks::park_pending(&ctx.pool, &task.id, &log, crate::db::next_utc_midnight()).await?;
            mirror(ctx, task, StatusLabel::Queued, Some(&log));
        }
        ErrorKind::ReauthRequired => {
            ctx.registry.quiesce_uploads(&task.channel_id);
            let log = ErrorLog::new(stage.index(), failure.kind, &failure.message, task.retry_count);
            tasks::park_pending(
                &ctx.pool,
                &task.id,
                &log,
                Utc::now() + ChronoDuration::minutes(PARK_MINUTES),
            )
            .await?;
            ctx.alert(
                AlertSeverity::Error,
                "upload reauthorization required",
                json!({"channel": task.channel_id, "task": task.id}),
            )
            .await;
            mirror(ctx, task, stage_error_label(stage), Some(&log));
        }
        ErrorKind::Infrastructure => {
            let log = ErrorLog::new(stage.index(), failure.kind, &failure.message, task.retry_count);
            tasks::park_pending(
                &ctx.pool,
                &task.id,
                &log,
                Utc::now() + ChronoDuration::minutes(PARK_MINUTES),
            )
            .await?;
            ctx.alert(
                AlertSeverity::Critical,
                "infrastructure failure during stage",
                json!({"channel": task.channel_id, "task": task.id, "stage": stage.index(), "error": failure.message}),
            )
            .await;
        }
        ErrorKind::RetriableTransient => {
            let retry_count = task.retry_count + 1;
            if retry_count >= MAX_TASK_RETRIES {
                let log = ErrorLog::new(
                    stage.index(),
                    ErrorKind::RetriableExhausted,
                    &failure.message,
                    retry_count,
                );
                fail(ctx, task, stage, log).await?;
            } else {
                let log = ErrorLog::new(stage.index(), failure.kind, &failure.message, retry_count);
                let available_at = Utc::now() + retry_backoff(retry_count);
                tasks::schedule_retry(&ctx.pool, &task.id, retry_count, &log, available_at).await?;
                METRICS.inc(&METRICS.tasks_retried);
                mirror(ctx, task, stage_error_label(stage), Some(&log));
                info!(task = %task.id, retry_count, available_at = %available_at, "retry scheduled");
            }
        }
        ErrorKind::PermanentClient | ErrorKind::RetriableExhausted | ErrorKind::ReviewRejected => {
            let log = ErrorLog::new(stage.index(), ErrorKind::PermanentClient, &failure.message, task.retry_count);
            fail(ctx, task, stage, log).await?;
        }
    }
    Ok(())
}

async fn fail(ctx: &AppContext, task: &TaskRow, stage: Stage, log: ErrorLog) -> Result<()> {
    tasks::fail_task(&ctx.pool, &task.id, &log).await?;
    METRICS.inc(&METRICS.tasks_failed);
    audit::append(
        &ctx.pool,
        Some(&task.channel_id),
        Some(&task.id),
        audit::actions::TASK_FAILED,
        "system",
        Some(&log.message),
        &json!({"stage": stage.index(), "kind": log.kind.as_db_str()}),
    )
    .await?;
    ctx.alert(
        AlertSeverity::Error,
        "task failed terminally",
        json!({"channel": task.channel_id, "task": task.id, "stage": stage.index(), "error": log.message}),
    )
    .await;
    mirror(ctx, task, stage_error_label(stage), Some(&log));
    error!(task = %task.id, stage = %stage, "task failed terminally");
    Ok(())
}

/// Clear bits for stages whose expected outputs vanished from the
/// workspace, so resume regenerates rather than trusting a stale bitmap.
async fn reconcile_bitmap(ctx: &AppContext, task: TaskRow) -> Result<TaskRow> {
    let ws = stages::workspace_for(ctx, &task);
    let mut bitmap = task.bitmap();
    for stage in Stage::ALL {
        if !has_stage(bitmap, *stage) {
            continue;
        }
        let expected = ws.stage_outputs(stage.index());
        if expected.iter().any(|path| !path.exists()) && !expected.is_empty() {
            warn!(task = %task.id, stage = %stage, "outputs missing; clearing stage bit");
            bitmap &= !reelforge_protocol::stage_bit(*stage);
        }
    }
    if bitmap != task.bitmap() {
        tasks::set_completed_stages(&ctx.pool, &task.id, bitmap).await?;
        return refetch(ctx, &task.id).await;
    }
    Ok(task)
}

async fn refetch(ctx: &AppContext, id: &str) -> Result<TaskRow> {
    tasks::get_task(&ctx.pool, id)
        .await?
        .context("task row vanished mid-run")
}

/// Queue an outbound status mirror for a task.
pub fn mirror(ctx: &AppContext, task: &TaskRow, label: StatusLabel, error: Option<&ErrorLog>) {
    ctx.mirror.push(MirrorPost {
        task_id: task.id.clone(),
        channel_id: task.channel_id.clone(),
        page_ref: task.planning_page_ref.clone(),
        label,
        error_summary: error.map(|e| e.summary()),
        posted_at: Utc::now(),
    });
}

/// Errors surfaced by the review/retry control operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("gate closed: {0}")]
    GateClosed(String),

    #[error("task {0} is not in a terminal state")]
    NotTerminal(String),
}

/// Record a reviewer decision for the task's open gate; shared by the HTTP
/// surface and the inbound reconciler.
pub async fn apply_review_decision(
    ctx: &AppContext,
    task_id: &str,
    decision: ReviewDecision,
    reviewer: &str,
    note: Option<&str>,
) -> Result<()> {
    let task = tasks::get_task(&ctx.pool, task_id)
        .await?
        .ok_or_else(|| ControlError::TaskNotFound(task_id.to_string()))?;

    if task.task_state() != TaskState::AwaitingReview {
        return Err(ControlError::GateClosed(format!(
            "task {task_id} is {} (not awaiting review)",
            task.state
        ))
        .into());
    }
    let gate = task
        .current_gate()
        .ok_or_else(|| ControlError::GateClosed(format!("stage {} has no gate", task.stage_index)))?;

    let recorded = reviews::record_decision(
        &ctx.pool,
        &task.id,
        gate,
        task.attempt,
        reviewer,
        decision,
        note,
    )
    .await;
    if let Err(err) = recorded {
        if err.downcast_ref::<reviews::GateClosed>().is_some() {
            return Err(ControlError::GateClosed(err.to_string()).into());
        }
        return Err(err);
    }

    let (action, severity_note) = match decision {
        ReviewDecision::Approved => (audit::actions::REVIEW_APPROVED, "approved"),
        ReviewDecision::Rejected => (audit::actions::REVIEW_REJECTED, "rejected"),
    };
    audit::append(
        &ctx.pool,
        Some(&task.channel_id),
        Some(&task.id),
        action,
        reviewer,
        note,
        &json!({"gate": gate.as_db_str(), "attempt": task.attempt, "decision": severity_note}),
    )
    .await?;

    match decision {
        ReviewDecision::Approved => {
            let resume = task
                .stage()
                .next()
                .unwrap_or(Stage::Finalize);
            tasks::approve_task(&ctx.pool, &task.id, resume).await?;
            mirror(ctx, &task, gate_approved_label(gate), None);
            ctx.wake.notify_waiters();
            info!(task = %task.id, gate = %gate, reviewer, "gate approved");
        }
        ReviewDecision::Rejected => {
            let log = ErrorLog::new(
                task.stage_index as u8,
                ErrorKind::ReviewRejected,
                note.unwrap_or("rejected"),
                task.retry_count,
            );
            tasks::reject_task(&ctx.pool, &task, task.stage(), &log).await?;
            METRICS.inc(&METRICS.tasks_rejected);
            mirror(ctx, &task, stage_error_label(task.stage()), Some(&log));
            info!(task = %task.id, gate = %gate, reviewer, "gate rejected");
        }
    }
    Ok(())
}

/// Manual retry of a `failed` or `rejected` task: clean rejected outputs,
/// then back to `pending` at the first incomplete stage as a new attempt.
pub async fn perform_manual_retry(
    ctx: &AppContext,
    task_id: &str,
    actor: &str,
    note: Option<&str>,
) -> Result<TaskRow> {
    let task = tasks::get_task(&ctx.pool, task_id)
        .await?
        .ok_or_else(|| ControlError::TaskNotFound(task_id.to_string()))?;

    let state = task.task_state();
    if !matches!(state, TaskState::Failed | TaskState::Rejected) {
        return Err(ControlError::NotTerminal(task_id.to_string()).into());
    }

    if state == TaskState::Rejected {
        if let Some(rejection) = reviews::latest_rejection(&ctx.pool, &task.id).await? {
            if let Some(gate) = rejection.gate_parsed() {
                let stage = gate.stage();
                let ws = stages::workspace_for(ctx, &task);
                let scenes = rejection
                    .note
                    .as_deref()
                    .map(|n| stages::scenes_from_note(n, ws.stage_outputs(stage.index()).len()))
                    .filter(|s| !s.is_empty());
                let deleted =
                    stages::delete_stage_outputs(&ws, stage, scenes.as_deref()).unwrap_or(0);
                info!(task = %task.id, stage = %stage, deleted, "cleared rejected outputs");
            }
        }
    }

    let resume = reelforge_protocol::task::first_incomplete_stage(task.bitmap())
        .unwrap_or(Stage::Finalize);
    tasks::manual_retry(&ctx.pool, &task, resume).await?;

    audit::append(
        &ctx.pool,
        Some(&task.channel_id),
        Some(&task.id),
        audit::actions::MANUAL_RETRY,
        actor,
        note,
        &json!({"resume_stage": resume.index(), "attempt": task.attempt + 1}),
    )
    .await?;
    mirror(ctx, &task, StatusLabel::Queued, None);
    ctx.wake.notify_waiters();

    refetch(ctx, &task.id).await
}
