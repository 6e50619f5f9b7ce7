//! Error taxonomy shared by the clients, the runner and the pipeline engine.
//!
//! Each layer classifies the errors it understands; the pipeline engine is
//! the single point that decides retry vs terminal from the resulting
//! `ErrorKind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriability {
    Retriable,
    Terminal,
}

/// Classified failure kinds, persisted on the task as `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout/reset, 429, 5xx, subprocess timeout
    RetriableTransient,
    /// Retriable failure whose retry budget ran out
    RetriableExhausted,
    /// 400/401/403/404/501, parse errors, permanent subprocess failures
    PermanentClient,
    /// Upload or provider daily quota exhausted; parked to next UTC midnight
    Quota,
    /// A reviewer rejected the task at a gate
    ReviewRejected,
    /// DB unreachable, key missing, workspace unwritable
    Infrastructure,
    /// OAuth refresh failed; uploads quiesced for the channel
    ReauthRequired,
}

impl ErrorKind {
    pub const ALL: &'static [ErrorKind] = &[
        ErrorKind::RetriableTransient,
        ErrorKind::RetriableExhausted,
        ErrorKind::PermanentClient,
        ErrorKind::Quota,
        ErrorKind::ReviewRejected,
        ErrorKind::Infrastructure,
        ErrorKind::ReauthRequired,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ErrorKind::RetriableTransient => "retriable_transient",
            ErrorKind::RetriableExhausted => "retriable_exhausted",
            ErrorKind::PermanentClient => "permanent_client",
            ErrorKind::Quota => "quota",
            ErrorKind::ReviewRejected => "review_rejected",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::ReauthRequired => "reauth_required",
        }
    }

    pub fn parse(value: &str) -> Option<ErrorKind> {
        Self::ALL.iter().copied().find(|k| k.as_db_str() == value)
    }

    pub fn retriability(&self) -> Retriability {
        match self {
            ErrorKind::RetriableTransient => Retriability::Retriable,
            _ => Retriability::Terminal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// The structured failure record stored in the task's `error_log` column and
/// surfaced on the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub stage: u8,
    pub kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub retry_count: i64,
}

impl ErrorLog {
    pub fn new(stage: u8, kind: ErrorKind, message: impl Into<String>, retry_count: i64) -> Self {
        Self {
            stage,
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            retry_count,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(value: &str) -> Option<ErrorLog> {
        serde_json::from_str(value).ok()
    }

    /// Short form for the planning-database error summary field.
    pub fn summary(&self) -> String {
        format!("stage {}: {} ({})", self.stage, self.message, self.kind)
    }
}
