//! Deterministic per-(channel, project) workspace layout.
//!
//! The external programs rely on exactly this directory scheme; every path
//! an invocation reads or writes comes from here, and nothing outside the
//! per-project subtree is ever produced.
//!
//! ```text
//! <root>/channels/<channel_id>/projects/<project_id>/
//!     assets/{characters,environments,props,composites}/
//!     videos/        clip_01..clip_18
//!     audio/         narration_01..narration_18
//!     sfx/           sfx_01..sfx_18
//!     <project_id>_final.mp4
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// 8 characters + 8 environments + 6 props = the 22 generated assets.
pub const CHARACTER_SLOTS: usize = 8;
pub const ENVIRONMENT_SLOTS: usize = 8;
pub const PROP_SLOTS: usize = 6;

/// Scenes per video: one composite, clip, narration and sfx track each.
pub const SCENE_COUNT: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Character,
    Environment,
    Prop,
}

impl AssetKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Character => "characters",
            AssetKind::Environment => "environments",
            AssetKind::Prop => "props",
        }
    }

    pub fn file_stem(&self) -> &'static str {
        match self {
            AssetKind::Character => "character",
            AssetKind::Environment => "environment",
            AssetKind::Prop => "prop",
        }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            AssetKind::Character => CHARACTER_SLOTS,
            AssetKind::Environment => ENVIRONMENT_SLOTS,
            AssetKind::Prop => PROP_SLOTS,
        }
    }
}

/// One of the 22 asset slots of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSlot {
    pub kind: AssetKind,
    /// 1-based within the kind.
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProjectWorkspace {
    project_dir: PathBuf,
    project_id: String,
}

impl ProjectWorkspace {
    pub fn new(root: &Path, channel_id: &str, project_id: &str) -> ProjectWorkspace {
        let project_dir = root
            .join("channels")
            .join(channel_id)
            .join("projects")
            .join(project_id);
        ProjectWorkspace {
            project_dir,
            project_id: project_id.to_string(),
        }
    }

    /// Idempotently create the full directory tree.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.assets_dir().join("characters"),
            self.assets_dir().join("environments"),
            self.assets_dir().join("props"),
            self.composites_dir(),
            self.videos_dir(),
            self.audio_dir(),
            self.sfx_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.project_dir.join("assets")
    }

    pub fn composites_dir(&self) -> PathBuf {
        self.assets_dir().join("composites")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.project_dir.join("videos")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.project_dir.join("audio")
    }

    pub fn sfx_dir(&self) -> PathBuf {
        self.project_dir.join("sfx")
    }

    /// The 22 asset slots in generation order.
    pub fn asset_slots(&self) -> Vec<AssetSlot> {
        let mut slots = Vec::with_capacity(CHARACTER_SLOTS + ENVIRONMENT_SLOTS + PROP_SLOTS);
        for kind in [AssetKind::Character, AssetKind::Environment, AssetKind::Prop] {
            for index in 1..=kind.slot_count() {
                slots.push(AssetSlot {
                    kind,
                    index,
                    path: self.asset_path(kind, index),
                });
            }
        }
        slots
    }

    pub fn asset_path(&self, kind: AssetKind, index: usize) -> PathBuf {
        self.assets_dir()
            .join(kind.dir_name())
            .join(format!("{}_{:02}.png", kind.file_stem(), index))
    }

    /// Composite for a scene, 1-based.
    pub fn composite_path(&self, scene: usize) -> PathBuf {
        self.composites_dir().join(format!("composite_{scene:02}.png"))
    }

    /// Video clip for a scene, 1-based.
    pub fn clip_path(&self, scene: usize) -> PathBuf {
        self.videos_dir().join(format!("clip_{scene:02}.mp4"))
    }

    /// Narration track for a scene, 1-based.
    pub fn narration_path(&self, scene: usize) -> PathBuf {
        self.audio_dir().join(format!("narration_{scene:02}.mp3"))
    }

    /// Sound-effects track for a scene, 1-based.
    pub fn sfx_path(&self, scene: usize) -> PathBuf {
        self.sfx_dir().join(format!("sfx_{scene:02}.wav"))
    }

    pub fn final_video_path(&self) -> PathBuf {
        self.project_dir
            .join(format!("{}_final.mp4", self.project_id))
    }

    /// Expected output paths for one stage index, used by the engine's
    /// resume check. Upload and finalize produce no files.
    pub fn stage_outputs(&self, stage_index: u8) -> Vec<PathBuf> {
        match stage_index {
            0 => self.asset_slots().into_iter().map(|s| s.path).collect(),
            1 => (1..=SCENE_COUNT).map(|i| self.composite_path(i)).collect(),
            2 => (1..=SCENE_COUNT).map(|i| self.clip_path(i)).collect(),
            3 => (1..=SCENE_COUNT).map(|i| self.narration_path(i)).collect(),
            4 => (1..=SCENE_COUNT).map(|i| self.sfx_path(i)).collect(),
            5 => vec![self.final_video_path()],
            _ => Vec::new(),
        }
    }
}
