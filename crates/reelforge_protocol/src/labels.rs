//! Planning-database status labels and their mapping from internal state.
//!
//! The planning database shows 26 user-visible labels. Internally a task has
//! 9 lifecycle states plus a stage index; `status_label` is the single
//! authority for the internal -> external mapping. `Draft` and `Queued` are
//! written by users; the mirror produces everything from `Queued` onward.

use crate::task::{ReviewGate, Stage, TaskState};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusLabel {
    Draft,
    Queued,
    Claimed,
    GeneratingAssets,
    AssetsReady,
    AssetsApproved,
    GeneratingComposites,
    CompositesReady,
    GeneratingVideo,
    VideoReady,
    VideoApproved,
    GeneratingAudio,
    AudioReady,
    AudioApproved,
    GeneratingSfx,
    SfxReady,
    Assembling,
    AssemblyReady,
    FinalReview,
    Approved,
    Uploading,
    Published,
    AssetError,
    VideoError,
    AudioError,
    UploadError,
}

impl StatusLabel {
    pub const ALL: &'static [StatusLabel] = &[
        StatusLabel::Draft,
        StatusLabel::Queued,
        StatusLabel::Claimed,
        StatusLabel::GeneratingAssets,
        StatusLabel::AssetsReady,
        StatusLabel::AssetsApproved,
        StatusLabel::GeneratingComposites,
        StatusLabel::CompositesReady,
        StatusLabel::GeneratingVideo,
        StatusLabel::VideoReady,
        StatusLabel::VideoApproved,
        StatusLabel::GeneratingAudio,
        StatusLabel::AudioReady,
        StatusLabel::AudioApproved,
        StatusLabel::GeneratingSfx,
        StatusLabel::SfxReady,
        StatusLabel::Assembling,
        StatusLabel::AssemblyReady,
        StatusLabel::FinalReview,
        StatusLabel::Approved,
        StatusLabel::Uploading,
        StatusLabel::Published,
        StatusLabel::AssetError,
        StatusLabel::VideoError,
        StatusLabel::AudioError,
        StatusLabel::UploadError,
    ];

    /// The exact select value shown in the planning database.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLabel::Draft => "Draft",
            StatusLabel::Queued => "Queued",
            StatusLabel::Claimed => "Claimed",
            StatusLabel::GeneratingAssets => "Generating Assets",
            StatusLabel::AssetsReady => "Assets Ready",
            StatusLabel::AssetsApproved => "Assets Approved",
            StatusLabel::GeneratingComposites => "Generating Composites",
            StatusLabel::CompositesReady => "Composites Ready",
            StatusLabel::GeneratingVideo => "Generating Video",
            StatusLabel::VideoReady => "Video Ready",
            StatusLabel::VideoApproved => "Video Approved",
            StatusLabel::GeneratingAudio => "Generating Audio",
            StatusLabel::AudioReady => "Audio Ready",
            StatusLabel::AudioApproved => "Audio Approved",
            StatusLabel::GeneratingSfx => "Generating SFX",
            StatusLabel::SfxReady => "SFX Ready",
            StatusLabel::Assembling => "Assembling",
            StatusLabel::AssemblyReady => "Assembly Ready",
            StatusLabel::FinalReview => "Final Review",
            StatusLabel::Approved => "Approved",
            StatusLabel::Uploading => "Uploading",
            StatusLabel::Published => "Published",
            StatusLabel::AssetError => "Asset Error",
            StatusLabel::VideoError => "Video Error",
            StatusLabel::AudioError => "Audio Error",
            StatusLabel::UploadError => "Upload Error",
        }
    }

    pub fn parse(value: &str) -> Option<StatusLabel> {
        Self::ALL.iter().copied().find(|l| l.as_str() == value)
    }

    /// User-driven labels the inbound poll reacts to.
    pub fn is_user_retry(&self) -> bool {
        // Re-selecting Queued on an errored page is the user's retry signal.
        matches!(self, StatusLabel::Queued)
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StatusLabel::AssetError
                | StatusLabel::VideoError
                | StatusLabel::AudioError
                | StatusLabel::UploadError
        )
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label mirrored when a stage begins executing.
pub fn stage_start_label(stage: Stage) -> StatusLabel {
    match stage {
        Stage::GenerateAssets => StatusLabel::GeneratingAssets,
        Stage::BuildComposites => StatusLabel::GeneratingComposites,
        Stage::GenerateVideo => StatusLabel::GeneratingVideo,
        Stage::GenerateNarration => StatusLabel::GeneratingAudio,
        Stage::GenerateSfx => StatusLabel::GeneratingSfx,
        Stage::AssembleVideo => StatusLabel::Assembling,
        Stage::Upload | Stage::Finalize => StatusLabel::Uploading,
    }
}

/// Label mirrored when a stage completes successfully. Stages with a review
/// gate surface their "Ready" label; gateless stages surface their transient
/// completion label. `Upload` has no completion label of its own (the
/// finalize stage ends in `Published`).
pub fn stage_done_label(stage: Stage) -> Option<StatusLabel> {
    match stage {
        Stage::GenerateAssets => Some(StatusLabel::AssetsReady),
        Stage::BuildComposites => Some(StatusLabel::CompositesReady),
        Stage::GenerateVideo => Some(StatusLabel::VideoReady),
        Stage::GenerateNarration => Some(StatusLabel::AudioReady),
        Stage::GenerateSfx => Some(StatusLabel::SfxReady),
        Stage::AssembleVideo => Some(StatusLabel::AssemblyReady),
        Stage::Upload => None,
        Stage::Finalize => Some(StatusLabel::Published),
    }
}

/// Label shown while a gate waits for its decision.
pub fn gate_waiting_label(gate: ReviewGate) -> StatusLabel {
    match gate {
        ReviewGate::Assets => StatusLabel::AssetsReady,
        ReviewGate::Video => StatusLabel::VideoReady,
        ReviewGate::Audio => StatusLabel::SfxReady,
        ReviewGate::Final => StatusLabel::FinalReview,
    }
}

/// Label mirrored when a gate is approved.
pub fn gate_approved_label(gate: ReviewGate) -> StatusLabel {
    match gate {
        ReviewGate::Assets => StatusLabel::AssetsApproved,
        ReviewGate::Video => StatusLabel::VideoApproved,
        ReviewGate::Audio => StatusLabel::AudioApproved,
        ReviewGate::Final => StatusLabel::Approved,
    }
}

/// Error label for a failure at a given stage.
pub fn stage_error_label(stage: Stage) -> StatusLabel {
    match stage {
        Stage::GenerateAssets | Stage::BuildComposites => StatusLabel::AssetError,
        Stage::GenerateVideo | Stage::AssembleVideo => StatusLabel::VideoError,
        Stage::GenerateNarration | Stage::GenerateSfx => StatusLabel::AudioError,
        Stage::Upload | Stage::Finalize => StatusLabel::UploadError,
    }
}

/// Map internal `(state, stage, gate)` to the mirrored label. The single
/// authority for the 9-state / 26-label correspondence.
pub fn status_label(state: TaskState, stage: Stage, gate: Option<ReviewGate>) -> StatusLabel {
    match state {
        TaskState::Pending => StatusLabel::Queued,
        TaskState::Claimed => StatusLabel::Claimed,
        TaskState::Processing => stage_start_label(stage),
        TaskState::AwaitingReview => {
            gate_waiting_label(gate.unwrap_or_else(|| {
                stage.gate_after().unwrap_or(ReviewGate::Final)
            }))
        }
        TaskState::Approved => {
            gate_approved_label(gate.unwrap_or_else(|| {
                stage.gate_after().unwrap_or(ReviewGate::Final)
            }))
        }
        TaskState::Retry | TaskState::Failed => stage_error_label(stage),
        TaskState::Rejected => stage_error_label(stage),
        TaskState::Completed => StatusLabel::Published,
    }
}
