//! Subprocess supervision and workspace layout.
//!
//! The six media-generation programs are pre-existing command-line tools
//! invoked unchanged from a fixed `scripts/` directory. This crate runs them
//! off the async executor with timeouts and bounded output capture, and owns
//! the deterministic per-(channel, project) directory scheme their file
//! contracts depend on.

pub mod layout;
pub mod programs;
pub mod supervisor;

pub use layout::{
    AssetKind, AssetSlot, ProjectWorkspace, CHARACTER_SLOTS, ENVIRONMENT_SLOTS, PROP_SLOTS,
    SCENE_COUNT,
};
pub use programs::{ExternalProgram, Invocation};
pub use supervisor::{RunOutput, RunnerError, Supervisor};
