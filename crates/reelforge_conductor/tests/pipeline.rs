//! End-to-end pipeline scenarios against stub scripts and fake clients.

mod common;

use chrono::Utc;
use common::{harness, write_script};
use reelforge_conductor::db::{costs, ledger, queue, reviews, tasks};
use reelforge_conductor::engine;
use reelforge_protocol::{has_stage, Priority, ReviewDecision, Stage, TaskState};
use std::collections::HashSet;
use std::time::SystemTime;

fn new_task(channel: &str, page: &str) -> tasks::NewTask {
    tasks::NewTask {
        channel_id: channel.to_string(),
        planning_page_ref: page.to_string(),
        title: format!("Video for {page}"),
        topic: "volcanoes".to_string(),
        story_direction: "educational, upbeat".to_string(),
        priority: Priority::Normal,
    }
}

async fn approve(h: &common::Harness, task_id: &str) {
    engine::apply_review_decision(&h.ctx, task_id, ReviewDecision::Approved, "reviewer", None)
        .await
        .unwrap();
}

fn mtime(path: &std::path::Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[tokio::test]
async fn happy_path_single_channel() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    // Stage 0 runs and parks at the assets gate.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert!(has_stage(row.bitmap(), Stage::GenerateAssets));
    let ws = h.workspace(&row);
    assert_eq!(ws.asset_slots().iter().filter(|s| s.path.exists()).count(), 22);

    approve(&h, &task.id).await;

    // Composites + clips, then the video gate.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert_eq!(row.stage_index, 2);
    assert!((1..=18).all(|i| ws.composite_path(i).exists()));
    assert!((1..=18).all(|i| ws.clip_path(i).exists()));

    approve(&h, &task.id).await;

    // Narration + SFX, then the audio gate (after SFX).
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert_eq!(row.stage_index, 4);
    assert!((1..=18).all(|i| ws.narration_path(i).exists()));
    assert!((1..=18).all(|i| ws.sfx_path(i).exists()));

    approve(&h, &task.id).await;

    // Assembly, then the final gate.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert!(ws.final_video_path().exists());

    approve(&h, &task.id).await;

    // Upload + finalize.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::Completed);
    // P8: completed implies bit 7.
    assert!(has_stage(row.bitmap(), Stage::Finalize));
    assert!(row.video_url.as_deref().unwrap_or("").contains("vid-0"));

    // The planning page got a non-empty upload URL.
    let urls = h.planning.upload_urls.lock().unwrap().clone();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].0, "page-1");
    assert!(!urls[0].1.is_empty());

    // Cost entries for every component.
    let entries = costs::costs_for_task(&h.ctx.pool, &task.id).await.unwrap();
    let components: HashSet<String> = entries.iter().map(|e| e.component.clone()).collect();
    for component in [
        "assets",
        "composites",
        "video_clips",
        "narration",
        "sfx",
        "assembly",
        "upload",
        "planning_db",
    ] {
        assert!(components.contains(component), "missing {component} cost");
    }

    // Mirrored labels arrive in the canonical order.
    let labels = h.mirrored_labels();
    let expected = [
        "Generating Assets",
        "Assets Ready",
        "Assets Approved",
        "Generating Composites",
        "Composites Ready",
        "Generating Video",
        "Video Ready",
        "Video Approved",
        "Generating Audio",
        "Audio Ready",
        "Generating SFX",
        "SFX Ready",
        "Audio Approved",
        "Assembling",
        "Assembly Ready",
        "Final Review",
        "Approved",
        "Uploading",
        "Published",
    ];
    assert_eq!(labels, expected);
}

#[tokio::test]
async fn retry_and_recovery_regenerates_only_the_failed_clip() {
    let h = harness().await;

    // generate_video fails on scene 11 while the countdown file is > 0.
    let state_file = h.scripts_dir.path().join("fails_remaining");
    std::fs::write(&state_file, "3").unwrap();
    let body = format!(
        r#"out=""; scene=""
while [ $# -gt 0 ]; do
  case "$1" in
    --out) out="$2";;
    --scene) scene="$2";;
  esac
  shift
done
if [ "$scene" = "11" ]; then
  n=$(cat "{state}")
  if [ "$n" -gt 0 ]; then
    echo $((n-1)) > "{state}"
    echo "timeout talking to renderer" >&2
    exit 1
  fi
fi
printf 'clip\n' > "$out"
"#,
        state = state_file.display()
    );
    write_script(h.scripts_dir.path(), "generate_video", &body);

    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    // Assets gate.
    h.drive_one().await.unwrap();
    approve(&h, &task.id).await;

    // Three transient failures on clip 11.
    let schedule_minutes = [1i64, 5, 15];
    let mut first_ten_mtimes = Vec::new();
    for (i, expected_minutes) in schedule_minutes.iter().enumerate() {
        let before = Utc::now();
        let row = h.drive_one().await.unwrap();
        assert_eq!(row.task_state(), TaskState::Retry);
        assert_eq!(row.retry_count, i as i64 + 1);

        // Backoff schedule: ~1, ~5, ~15 minutes.
        let available = chrono::DateTime::parse_from_rfc3339(&row.available_at)
            .unwrap()
            .with_timezone(&Utc);
        let delta_secs = (available - before).num_seconds();
        let expected_secs = expected_minutes * 60;
        assert!(
            (delta_secs - expected_secs).abs() <= 30,
            "attempt {}: expected ~{expected_secs}s backoff, got {delta_secs}s",
            i + 1
        );

        let ws = h.workspace(&row);
        if first_ten_mtimes.is_empty() {
            first_ten_mtimes = (1..=10).map(|s| mtime(&ws.clip_path(s))).collect();
        }
        assert!(!ws.clip_path(11).exists());

        // Make the task claimable immediately for the next attempt.
        sqlx::query("UPDATE tasks SET available_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&row.id)
            .execute(&h.ctx.pool)
            .await
            .unwrap();
    }

    // Fourth attempt succeeds and parks at the video gate.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert_eq!(row.retry_count, 3);
    let ws = h.workspace(&row);
    assert!((1..=18).all(|s| ws.clip_path(s).exists()));

    // Clips 1-10 were reused, never regenerated.
    let after: Vec<SystemTime> = (1..=10).map(|s| mtime(&ws.clip_path(s))).collect();
    assert_eq!(first_ten_mtimes, after);
}

#[tokio::test]
async fn five_transient_failures_become_terminal() {
    let h = harness().await;
    // Asset generation always fails with a transient error.
    write_script(
        h.scripts_dir.path(),
        "generate_asset",
        "echo 'connection reset by peer' >&2\nexit 1\n",
    );

    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    for expected_retry in 1..=4 {
        let row = h.drive_one().await.unwrap();
        assert_eq!(row.task_state(), TaskState::Retry);
        assert_eq!(row.retry_count, expected_retry);
        sqlx::query("UPDATE tasks SET available_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&row.id)
            .execute(&h.ctx.pool)
            .await
            .unwrap();
    }

    // The fifth retriable failure is terminal.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::Failed);
    let log = row.parsed_error_log().unwrap();
    assert_eq!(log.retry_count, 5);
    assert_eq!(task.id, row.id);
}

#[tokio::test]
async fn permanent_stderr_pattern_fails_without_retry() {
    let h = harness().await;
    write_script(
        h.scripts_dir.path(),
        "generate_asset",
        "echo 'content policy violation: prompt rejected' >&2\nexit 2\n",
    );

    tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::Failed);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn crash_resurrection_resumes_partial_narration() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    // Another worker died mid-stage 3 with 14 of 18 narrations written.
    let claimed = queue::claim_next(&h.ctx.pool, "worker-dead", &HashSet::new())
        .await
        .unwrap()
        .unwrap();
    h.materialize_outputs(&claimed, &[0, 1, 2]);
    let ws = h.workspace(&claimed);
    for scene in 1..=14 {
        std::fs::write(ws.narration_path(scene), b"narration").unwrap();
    }
    sqlx::query(
        "UPDATE tasks SET completed_stages = 7, stage_index = 3, state = 'processing',
             lease_expires_at = '2020-01-01T00:00:00Z' WHERE id = ?",
    )
    .bind(&task.id)
    .execute(&h.ctx.pool)
    .await
    .unwrap();

    // The lease expires; the sweeper returns the task to the queue.
    assert_eq!(queue::sweep_expired_leases(&h.ctx.pool).await.unwrap(), 1);

    let kept: Vec<SystemTime> = (1..=14).map(|s| mtime(&ws.narration_path(s))).collect();

    // Another worker picks it up and finishes narration + SFX.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.claimed_by, None);
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert!(has_stage(row.bitmap(), Stage::GenerateNarration));
    assert!(has_stage(row.bitmap(), Stage::GenerateSfx));
    assert!((1..=18).all(|s| ws.narration_path(s).exists()));

    // The 14 surviving files were retained.
    let after: Vec<SystemTime> = (1..=14).map(|s| mtime(&ws.narration_path(s))).collect();
    assert_eq!(kept, after);
}

#[tokio::test]
async fn quota_exhaustion_parks_until_next_utc_midnight() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    // Task positioned at the upload stage with everything rendered.
    h.materialize_outputs(&task, &[0, 1, 2, 3, 4, 5]);
    sqlx::query("UPDATE tasks SET completed_stages = 63, stage_index = 6 WHERE id = ?")
        .bind(&task.id)
        .execute(&h.ctx.pool)
        .await
        .unwrap();

    // Today's ledger cannot fit one more upload.
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    sqlx::query(
        "INSERT INTO upload_quota_ledger (channel_id, date, units_used, daily_ceiling)
         VALUES ('alpha', ?, 8400, 10000)",
    )
    .bind(&today)
    .execute(&h.ctx.pool)
    .await
    .unwrap();

    // The dispatcher pre-check skips the upload-stage task entirely.
    assert!(h.drive_one().await.is_none());
    assert_eq!(h.uploader.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // Forced through the engine (as if claimed just before the ledger
    // filled), the reservation fails and the task parks at next midnight.
    sqlx::query("UPDATE tasks SET state = 'claimed', claimed_by = 'w' WHERE id = ?")
        .bind(&task.id)
        .execute(&h.ctx.pool)
        .await
        .unwrap();
    let row = tasks::get_task(&h.ctx.pool, &task.id).await.unwrap().unwrap();
    engine::run_claimed_task(&h.ctx, row).await.unwrap();

    let parked = tasks::get_task(&h.ctx.pool, &task.id).await.unwrap().unwrap();
    assert_eq!(parked.task_state(), TaskState::Pending);
    assert!(parked.available_at.contains("T00:00:00"));
    // Retry budget untouched; no API call made; ledger unchanged (B2).
    assert_eq!(parked.retry_count, 0);
    assert_eq!(h.uploader.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let ledger_row = ledger::ledger_row(&h.ctx.pool, "alpha", &today)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger_row.units_used, 8400);
}

#[tokio::test]
async fn rejection_then_manual_retry_regenerates_named_clip() {
    let h = harness().await;
    let task = tasks::enqueue(&h.ctx.pool, &new_task("alpha", "page-1"))
        .await
        .unwrap();

    h.drive_one().await.unwrap();
    approve(&h, &task.id).await;
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert_eq!(row.stage_index, 2);

    engine::apply_review_decision(
        &h.ctx,
        &task.id,
        ReviewDecision::Rejected,
        "reviewer",
        Some("clip 7 glitched"),
    )
    .await
    .unwrap();

    let rejected = tasks::get_task(&h.ctx.pool, &task.id).await.unwrap().unwrap();
    assert_eq!(rejected.task_state(), TaskState::Rejected);
    assert!(!has_stage(rejected.bitmap(), Stage::GenerateVideo));

    // Approvals after the terminal outcome are refused.
    let late = engine::apply_review_decision(
        &h.ctx,
        &task.id,
        ReviewDecision::Approved,
        "reviewer",
        None,
    )
    .await;
    assert!(late.is_err());

    let ws = h.workspace(&rejected);
    let keep_mtime = mtime(&ws.clip_path(6));

    let retried = engine::perform_manual_retry(&h.ctx, &task.id, "reviewer", None)
        .await
        .unwrap();
    assert_eq!(retried.task_state(), TaskState::Pending);
    assert_eq!(retried.stage_index, 2);
    assert_eq!(retried.attempt, 2);
    // Only the named clip was deleted.
    assert!(!ws.clip_path(7).exists());
    assert!(ws.clip_path(6).exists());

    // The next run regenerates clip 7 alone and re-opens the video gate.
    let row = h.drive_one().await.unwrap();
    assert_eq!(row.task_state(), TaskState::AwaitingReview);
    assert!(ws.clip_path(7).exists());
    assert_eq!(mtime(&ws.clip_path(6)), keep_mtime);

    // A decisive review exists for both attempts.
    let all = reviews::reviews_for_task(&h.ctx.pool, &task.id).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn fair_scheduling_alternates_channels_and_drains_both() {
    let h = common::harness_with_channels(&["alpha", "beta"]).await;
    for i in 0..10 {
        tasks::enqueue(&h.ctx.pool, &new_task("alpha", &format!("a-{i}")))
            .await
            .unwrap();
    }
    for i in 0..2 {
        tasks::enqueue(&h.ctx.pool, &new_task("beta", &format!("b-{i}")))
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        let claimed = queue::claim_next(&h.ctx.pool, "w", &HashSet::new())
            .await
            .unwrap()
            .unwrap();
        order.push(claimed.channel_id.clone());
        sqlx::query("UPDATE tasks SET state = 'completed' WHERE id = ?")
            .bind(&claimed.id)
            .execute(&h.ctx.pool)
            .await
            .unwrap();
    }
    assert_eq!(order, vec!["alpha", "beta", "alpha", "beta"]);
}
