//! Alert severities and payload shape for the outbound alert sink.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// 80% quota / spend utilization, elevated retry rate
    Warning,
    /// Terminal task failure, upload permanent failure, reauth required
    Error,
    /// DB unreachable, idle workers with growing backlog, ledger corruption
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dispatched alert with its structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub summary: String,
    /// Structured context: channel, task, stage, error, ...
    pub context: serde_json::Value,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        summary: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            severity,
            summary: summary.into(),
            context,
        }
    }
}
