//! Stage bodies: what actually runs for each of the eight pipeline steps.
//!
//! Every stage is idempotent given the workspace: expected output files that
//! already exist are kept, only the missing ones are regenerated. No stage
//! body touches the database; costs and transitions are recorded by the
//! engine around it.

use crate::context::AppContext;
use crate::db::models::TaskRow;
use crate::registry::ChannelConfig;
use reelforge_clients::{
    ClientError, PlanningApi, UploadMeta, Uploader, VideoRef, UPLOAD_COST_UNITS,
};
use reelforge_protocol::{ErrorKind, Stage};
use reelforge_runner::{
    AssetSlot, ExternalProgram, Invocation, ProjectWorkspace, RunnerError, SCENE_COUNT,
};
use reelforge_vault::CredentialKind;
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

/// Per-unit USD prices charged by the external providers.
const ASSET_USD: f64 = 0.04;
const COMPOSITE_USD: f64 = 0.01;
const CLIP_USD: f64 = 0.50;
const NARRATION_USD: f64 = 0.08;
const SFX_USD: f64 = 0.05;
const ASSEMBLY_USD: f64 = 0.02;

/// Scenes rendered as split-screen composites.
fn is_split_screen_scene(scene: usize) -> bool {
    scene % 5 == 0
}

/// Cost attribution for one completed stage.
#[derive(Debug, Clone)]
pub struct StageCost {
    pub units: f64,
    pub usd: f64,
    pub api_calls: i64,
    pub metadata: serde_json::Value,
}

impl StageCost {
    fn free(metadata: serde_json::Value) -> StageCost {
        StageCost {
            units: 0.0,
            usd: 0.0,
            api_calls: 0,
            metadata,
        }
    }
}

/// Classified stage failure handed to the engine for the retry decision.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageFailure {
    pub fn from_runner(program: ExternalProgram, err: &RunnerError) -> StageFailure {
        match err {
            RunnerError::Timeout { .. } => StageFailure {
                kind: ErrorKind::RetriableTransient,
                message: err.to_string(),
            },
            RunnerError::SpawnFailed { .. } => StageFailure {
                kind: ErrorKind::Infrastructure,
                message: err.to_string(),
            },
            RunnerError::NonZeroExit { stderr, .. } => {
                let kind = if program.is_permanent_failure(stderr) {
                    ErrorKind::PermanentClient
                } else {
                    ErrorKind::RetriableTransient
                };
                StageFailure {
                    kind,
                    message: err.to_string(),
                }
            }
        }
    }

    pub fn from_client(err: &ClientError) -> StageFailure {
        StageFailure {
            kind: err.error_kind(),
            message: err.to_string(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> StageFailure {
        StageFailure {
            kind: ErrorKind::Infrastructure,
            message: message.into(),
        }
    }
}

/// Result of a successful stage: its cost entry plus, for the upload stage,
/// the published video reference.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub cost: StageCost,
    pub video: Option<VideoRef>,
}

pub fn workspace_for(ctx: &AppContext, task: &TaskRow) -> ProjectWorkspace {
    ProjectWorkspace::new(&ctx.workspace_root, &task.channel_id, &task.id)
}

/// Execute one stage body. The caller has already verified the stage bit is
/// unset and recorded the `processing` transition.
pub async fn execute_stage(
    ctx: &AppContext,
    config: &ChannelConfig,
    task: &TaskRow,
    stage: Stage,
) -> Result<StageOutput, StageFailure> {
    let ws = workspace_for(ctx, task);
    ws.ensure_dirs()
        .map_err(|e| StageFailure::infrastructure(format!("workspace unwritable: {e}")))?;

    match stage {
        Stage::GenerateAssets => generate_assets(ctx, task, &ws).await,
        Stage::BuildComposites => build_composites(ctx, &ws).await,
        Stage::GenerateVideo => generate_clips(ctx, task, &ws).await,
        Stage::GenerateNarration => generate_narration(ctx, config, task, &ws).await,
        Stage::GenerateSfx => generate_sfx(ctx, task, &ws).await,
        Stage::AssembleVideo => assemble(ctx, config, &ws).await,
        Stage::Upload => upload(ctx, config, task, &ws).await,
        Stage::Finalize => finalize(ctx, task).await,
    }
}

async fn generate_assets(
    ctx: &AppContext,
    task: &TaskRow,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let mut generated = 0i64;
    for slot in ws.asset_slots() {
        if slot.path.exists() {
            continue;
        }
        let prompt = asset_prompt(task, &slot);
        let invocation =
            Invocation::generate_asset(slot.kind.file_stem(), slot.index, &prompt, &slot.path);
        run(ctx, &invocation).await?;
        generated += 1;
    }
    info!(task = %task.id, generated, "asset stage complete");
    Ok(StageOutput {
        cost: StageCost {
            units: generated as f64,
            usd: generated as f64 * ASSET_USD,
            api_calls: generated,
            metadata: json!({"generated": generated, "slots": 22}),
        },
        video: None,
    })
}

async fn build_composites(
    ctx: &AppContext,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let mut built = 0i64;
    for scene in 1..=SCENE_COUNT {
        let out = ws.composite_path(scene);
        if out.exists() {
            continue;
        }
        let assets_dir = ws.assets_dir();
        let invocation = if is_split_screen_scene(scene) {
            Invocation::create_split_screen(scene, &assets_dir, &out)
        } else {
            Invocation::create_composite(scene, &assets_dir, &out)
        };
        run(ctx, &invocation).await?;
        built += 1;
    }
    Ok(StageOutput {
        cost: StageCost {
            units: built as f64,
            usd: built as f64 * COMPOSITE_USD,
            api_calls: built,
            metadata: json!({"built": built}),
        },
        video: None,
    })
}

async fn generate_clips(
    ctx: &AppContext,
    task: &TaskRow,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let mut generated = 0i64;
    for scene in 1..=SCENE_COUNT {
        let out = ws.clip_path(scene);
        if out.exists() {
            continue;
        }
        let composite = ws.composite_path(scene);
        let prompt = scene_prompt(task, scene);
        let invocation = Invocation::generate_video(scene, &composite, &prompt, &out);
        run(ctx, &invocation).await?;
        generated += 1;
    }
    Ok(StageOutput {
        cost: StageCost {
            units: generated as f64,
            usd: generated as f64 * CLIP_USD,
            api_calls: generated,
            metadata: json!({"generated": generated}),
        },
        video: None,
    })
}

async fn generate_narration(
    ctx: &AppContext,
    config: &ChannelConfig,
    task: &TaskRow,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let mut generated = 0i64;
    for scene in 1..=SCENE_COUNT {
        let out = ws.narration_path(scene);
        if out.exists() {
            continue;
        }
        let text = narration_text(task, scene);
        let invocation =
            Invocation::generate_audio(scene, &text, config.voice_id.as_deref(), &out);
        run(ctx, &invocation).await?;
        generated += 1;
    }
    Ok(StageOutput {
        cost: StageCost {
            units: generated as f64,
            usd: generated as f64 * NARRATION_USD,
            api_calls: generated,
            metadata: json!({"generated": generated, "voice": config.voice_id}),
        },
        video: None,
    })
}

async fn generate_sfx(
    ctx: &AppContext,
    task: &TaskRow,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let mut generated = 0i64;
    for scene in 1..=SCENE_COUNT {
        let out = ws.sfx_path(scene);
        if out.exists() {
            continue;
        }
        let prompt = format!("ambience and effects for scene {scene} of: {}", task.topic);
        let invocation = Invocation::generate_sound_effects(scene, &prompt, &out);
        run(ctx, &invocation).await?;
        generated += 1;
    }
    Ok(StageOutput {
        cost: StageCost {
            units: generated as f64,
            usd: generated as f64 * SFX_USD,
            api_calls: generated,
            metadata: json!({"generated": generated}),
        },
        video: None,
    })
}

async fn assemble(
    ctx: &AppContext,
    config: &ChannelConfig,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let out = ws.final_video_path();
    if out.exists() {
        return Ok(StageOutput {
            cost: StageCost::free(json!({"reused": true})),
            video: None,
        });
    }
    let invocation = Invocation::assemble_video(
        ws.project_dir(),
        config.branding.intro_path.as_deref(),
        config.branding.outro_path.as_deref(),
        &out,
    );
    run(ctx, &invocation).await?;
    Ok(StageOutput {
        cost: StageCost {
            units: 1.0,
            usd: ASSEMBLY_USD,
            api_calls: 1,
            metadata: json!({
                "intro": config.branding.intro_path.is_some(),
                "outro": config.branding.outro_path.is_some(),
            }),
        },
        video: None,
    })
}

/// Upload the assembled video. Quota units were reserved by the engine in a
/// prior short transaction; this body only refreshes credentials and talks
/// to the upload API.
async fn upload(
    ctx: &AppContext,
    config: &ChannelConfig,
    task: &TaskRow,
    ws: &ProjectWorkspace,
) -> Result<StageOutput, StageFailure> {
    let refresh_token = ctx
        .credential(&task.channel_id, CredentialKind::UploadRefreshToken)
        .await
        .map_err(|e| StageFailure {
            kind: ErrorKind::ReauthRequired,
            message: e.to_string(),
        })?;

    let access_token = ctx
        .oauth
        .access_token(&task.channel_id, &refresh_token)
        .await
        .map_err(|e| StageFailure::from_client(&e))?;

    let meta = UploadMeta {
        title: task.title.clone(),
        description: format!("{}\n\n{}", task.topic, task.story_direction),
        privacy: config.upload_privacy_default.clone(),
    };
    let video = ctx
        .uploader
        .upload_video(&access_token, &meta, &ws.final_video_path())
        .await
        .map_err(|e| StageFailure::from_client(&e))?;

    Ok(StageOutput {
        cost: StageCost {
            units: UPLOAD_COST_UNITS as f64,
            usd: 0.0,
            api_calls: 2,
            metadata: json!({"video_id": video.video_id, "url": video.url}),
        },
        video: Some(video),
    })
}

/// Write the published URL back onto the planning page.
async fn finalize(ctx: &AppContext, task: &TaskRow) -> Result<StageOutput, StageFailure> {
    let url = task.video_url.as_deref().ok_or_else(|| StageFailure {
        kind: ErrorKind::PermanentClient,
        message: "finalize reached without a recorded video URL".to_string(),
    })?;

    let token = ctx
        .credential(&task.channel_id, CredentialKind::PlanningToken)
        .await
        .map_err(|e| StageFailure::infrastructure(e.to_string()))?;

    ctx.planning
        .write_upload_url(&token, &task.planning_page_ref, url)
        .await
        .map_err(|e| StageFailure::from_client(&e))?;

    Ok(StageOutput {
        cost: StageCost {
            units: 0.0,
            usd: 0.0,
            api_calls: 1,
            metadata: json!({"url": url}),
        },
        video: None,
    })
}

async fn run(ctx: &AppContext, invocation: &Invocation) -> Result<(), StageFailure> {
    ctx.supervisor
        .run_invocation(invocation)
        .await
        .map(|_| ())
        .map_err(|e| {
            warn!(program = invocation.program.script_name(), error = %e, "program failed");
            StageFailure::from_runner(invocation.program, &e)
        })
}

fn asset_prompt(task: &TaskRow, slot: &AssetSlot) -> String {
    format!(
        "{} {} {} for '{}': {}",
        task.topic,
        slot.kind.file_stem(),
        slot.index,
        task.title,
        task.story_direction
    )
}

fn scene_prompt(task: &TaskRow, scene: usize) -> String {
    format!("scene {scene} of 18 for '{}': {}", task.title, task.story_direction)
}

fn narration_text(task: &TaskRow, scene: usize) -> String {
    format!("{} (scene {scene} of 18): {}", task.title, task.story_direction)
}

/// Delete a stage's output files before a manual retry. `scenes` narrows the
/// deletion to the slots a reviewer named; `None` clears the whole stage.
pub fn delete_stage_outputs(
    ws: &ProjectWorkspace,
    stage: Stage,
    scenes: Option<&[usize]>,
) -> std::io::Result<usize> {
    let all = ws.stage_outputs(stage.index());
    let targets: Vec<&Path> = match scenes {
        None => all.iter().map(|p| p.as_path()).collect(),
        Some(scenes) => all
            .iter()
            .enumerate()
            .filter(|(i, _)| scenes.contains(&(i + 1)))
            .map(|(_, p)| p.as_path())
            .collect(),
    };

    let mut deleted = 0;
    for path in targets {
        match std::fs::remove_file(path) {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}

/// Pull 1-based slot numbers out of a reviewer note ("clip 7 glitched").
pub fn scenes_from_note(note: &str, max: usize) -> Vec<usize> {
    let mut scenes = Vec::new();
    let mut current = 0usize;
    let mut in_number = false;
    for ch in note.chars().chain(std::iter::once(' ')) {
        if let Some(digit) = ch.to_digit(10) {
            current = current * 10 + digit as usize;
            in_number = true;
        } else if in_number {
            if current >= 1 && current <= max && !scenes.contains(&current) {
                scenes.push(current);
            }
            current = 0;
            in_number = false;
        }
    }
    scenes
}
