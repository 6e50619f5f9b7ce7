//! Client error type and retry classification.

use reelforge_protocol::{ErrorKind, Retriability};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Upload quota exhausted for channel {channel}: {used} + {cost} > {ceiling}")]
    QuotaExhausted {
        channel: String,
        used: i64,
        cost: i64,
        ceiling: i64,
    },

    #[error("Reauthorization required for channel {channel}")]
    ReauthRequired { channel: String },
}

impl ClientError {
    pub fn from_reqwest(err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::Parse(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }

    /// Retriable: timeout, reset, 429, 5xx other than 501.
    /// Terminal: other 4xx, 501, parse errors, quota, reauth.
    pub fn retriability(&self) -> Retriability {
        match self {
            ClientError::Timeout | ClientError::Network(_) => Retriability::Retriable,
            ClientError::Status { status, .. } => classify_status(*status),
            ClientError::Parse(_) => Retriability::Terminal,
            ClientError::QuotaExhausted { .. } => Retriability::Terminal,
            ClientError::ReauthRequired { .. } => Retriability::Terminal,
        }
    }

    /// Map into the task-level error taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ClientError::QuotaExhausted { .. } => ErrorKind::Quota,
            ClientError::ReauthRequired { .. } => ErrorKind::ReauthRequired,
            other => match other.retriability() {
                Retriability::Retriable => ErrorKind::RetriableTransient,
                Retriability::Terminal => ErrorKind::PermanentClient,
            },
        }
    }
}

/// Status-code classification shared by all clients.
pub fn classify_status(status: u16) -> Retriability {
    match status {
        429 => Retriability::Retriable,
        501 => Retriability::Terminal,
        500..=599 => Retriability::Retriable,
        _ => Retriability::Terminal,
    }
}
