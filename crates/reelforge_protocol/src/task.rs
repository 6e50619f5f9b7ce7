//! Task lifecycle states, pipeline stages and review gates.
//!
//! A task moves through eight ordered stages; orthogonally it carries one of
//! nine lifecycle states. Stage completion is tracked in a bitmap so a
//! re-claimed task resumes from the first incomplete stage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task, orthogonal to its stage index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready for a worker once `available_at` has passed
    #[default]
    Pending,
    /// A worker holds the lease but has not started the stage yet
    Claimed,
    /// A stage is executing
    Processing,
    /// Blocked on a human decision at a review gate
    AwaitingReview,
    /// Gate approved, about to resume at the next stage
    Approved,
    /// A retriable failure occurred; `available_at` holds the backoff
    Retry,
    /// A reviewer rejected the task; terminal until a manual retry
    Rejected,
    /// Terminal failure (retries exhausted or permanent error)
    Failed,
    /// All eight stages done, video published
    Completed,
}

impl TaskState {
    pub const ALL: &'static [TaskState] = &[
        TaskState::Pending,
        TaskState::Claimed,
        TaskState::Processing,
        TaskState::AwaitingReview,
        TaskState::Approved,
        TaskState::Retry,
        TaskState::Rejected,
        TaskState::Failed,
        TaskState::Completed,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Processing => "processing",
            TaskState::AwaitingReview => "awaiting_review",
            TaskState::Approved => "approved",
            TaskState::Retry => "retry",
            TaskState::Rejected => "rejected",
            TaskState::Failed => "failed",
            TaskState::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<TaskState> {
        Self::ALL.iter().copied().find(|s| s.as_db_str() == value)
    }

    /// Terminal states free the `(channel, planning_page_ref)` uniqueness slot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Rejected | TaskState::Failed | TaskState::Completed
        )
    }

    /// States the dispatcher may hand to a worker (subject to `available_at`).
    /// `Approved` rows resume at the stage after their gate.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Retry | TaskState::Approved
        )
    }

    /// States under an active worker lease.
    pub fn holds_lease(&self) -> bool {
        matches!(self, TaskState::Claimed | TaskState::Processing)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Task priority. Higher claims first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_i64(value: i64) -> Priority {
        match value {
            2 => Priority::High,
            0 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Parse the planning-database select value (`High`/`Normal`/`Low`).
    pub fn parse_label(value: &str) -> Option<Priority> {
        match value.to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "normal" | "medium" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// The eight ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GenerateAssets,
    BuildComposites,
    GenerateVideo,
    GenerateNarration,
    GenerateSfx,
    AssembleVideo,
    Upload,
    Finalize,
}

impl Stage {
    pub const ALL: &'static [Stage] = &[
        Stage::GenerateAssets,
        Stage::BuildComposites,
        Stage::GenerateVideo,
        Stage::GenerateNarration,
        Stage::GenerateSfx,
        Stage::AssembleVideo,
        Stage::Upload,
        Stage::Finalize,
    ];

    pub const COUNT: usize = 8;

    pub fn index(&self) -> u8 {
        match self {
            Stage::GenerateAssets => 0,
            Stage::BuildComposites => 1,
            Stage::GenerateVideo => 2,
            Stage::GenerateNarration => 3,
            Stage::GenerateSfx => 4,
            Stage::AssembleVideo => 5,
            Stage::Upload => 6,
            Stage::Finalize => 7,
        }
    }

    pub fn from_index(index: u8) -> Option<Stage> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn next(&self) -> Option<Stage> {
        Stage::from_index(self.index() + 1)
    }

    /// The review gate that must pass after this stage, if any.
    pub fn gate_after(&self) -> Option<ReviewGate> {
        match self {
            Stage::GenerateAssets => Some(ReviewGate::Assets),
            Stage::GenerateVideo => Some(ReviewGate::Video),
            Stage::GenerateSfx => Some(ReviewGate::Audio),
            Stage::AssembleVideo => Some(ReviewGate::Final),
            _ => None,
        }
    }

    /// Component tag used for cost entries.
    pub fn cost_component(&self) -> &'static str {
        match self {
            Stage::GenerateAssets => "assets",
            Stage::BuildComposites => "composites",
            Stage::GenerateVideo => "video_clips",
            Stage::GenerateNarration => "narration",
            Stage::GenerateSfx => "sfx",
            Stage::AssembleVideo => "assembly",
            Stage::Upload => "upload",
            Stage::Finalize => "planning_db",
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            Stage::GenerateAssets => "generate_assets",
            Stage::BuildComposites => "build_composites",
            Stage::GenerateVideo => "generate_video",
            Stage::GenerateNarration => "generate_narration",
            Stage::GenerateSfx => "generate_sfx",
            Stage::AssembleVideo => "assemble_video",
            Stage::Upload => "upload",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// The four human review gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewGate {
    Assets,
    Video,
    Audio,
    Final,
}

impl ReviewGate {
    pub const ALL: &'static [ReviewGate] = &[
        ReviewGate::Assets,
        ReviewGate::Video,
        ReviewGate::Audio,
        ReviewGate::Final,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ReviewGate::Assets => "assets",
            ReviewGate::Video => "video",
            ReviewGate::Audio => "audio",
            ReviewGate::Final => "final",
        }
    }

    pub fn parse(value: &str) -> Option<ReviewGate> {
        Self::ALL.iter().copied().find(|g| g.as_db_str() == value)
    }

    /// The stage whose success opens this gate.
    pub fn stage(&self) -> Stage {
        match self {
            ReviewGate::Assets => Stage::GenerateAssets,
            ReviewGate::Video => Stage::GenerateVideo,
            ReviewGate::Audio => Stage::GenerateSfx,
            ReviewGate::Final => Stage::AssembleVideo,
        }
    }
}

impl fmt::Display for ReviewGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A reviewer's decision at a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<ReviewDecision> {
        match value {
            "approved" => Some(ReviewDecision::Approved),
            "rejected" => Some(ReviewDecision::Rejected),
            _ => None,
        }
    }
}

/// Bit for a stage in the `completed_stages` bitmap.
pub fn stage_bit(stage: Stage) -> u32 {
    1 << stage.index()
}

/// Whether the bitmap marks a stage complete.
pub fn has_stage(bitmap: u32, stage: Stage) -> bool {
    bitmap & stage_bit(stage) != 0
}

/// Return the bitmap with a stage marked complete.
pub fn set_stage(bitmap: u32, stage: Stage) -> u32 {
    bitmap | stage_bit(stage)
}

/// First stage whose bit is not set, if any.
pub fn first_incomplete_stage(bitmap: u32) -> Option<Stage> {
    Stage::ALL.iter().copied().find(|s| !has_stage(bitmap, *s))
}
