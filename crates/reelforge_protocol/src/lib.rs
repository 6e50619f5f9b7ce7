//! Shared vocabulary for the Reelforge pipeline.
//!
//! Everything that crosses a crate boundary lives here: identifier wrappers,
//! the task lifecycle state machine, the eight pipeline stages and their
//! review gates, the planning-database status labels mirrored outward, the
//! error taxonomy, alert severities, and the HTTP API types.

pub mod alerts;
pub mod error;
pub mod http_types;
pub mod ids;
pub mod labels;
pub mod task;

pub use alerts::{Alert, AlertSeverity};
pub use error::{ErrorKind, ErrorLog, Retriability};
pub use http_types::{
    ChannelSummary, CostEntryView, ErrorResponse, HealthResponse, ReviewDecisionRequest,
    RetryRequest, TaskDetail, TaskSummary,
};
pub use ids::{ChannelId, CorrelationId, IdParseError, ProjectId, TaskId};
pub use labels::StatusLabel;
pub use task::{
    has_stage, set_stage, stage_bit, Priority, ReviewDecision, ReviewGate, Stage, TaskState,
};

/// Format a USD amount the way the HTTP surface expects: a string with
/// exactly four decimal places.
pub fn format_usd(amount: f64) -> String {
    format!("{amount:.4}")
}
