//! Client error types

use std::time::Duration;
use thiserror::Error;

/// Classified outcome of one marketplace call.
///
/// `Transport` and `Upstream` are transient and retried inside the client;
/// `Structural` and `Status` are fatal for the call: retrying cannot fix a
/// persistent schema mismatch or a rejected request. The poll loop's outer
/// handler absorbs both kinds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error contacting marketplace: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Marketplace rate-limited or unavailable (status={status})")]
    Upstream {
        status: u16,
        /// Server-provided retry hint, honored verbatim instead of backoff.
        retry_after: Option<Duration>,
    },

    #[error("Unexpected response structure from marketplace: {0}")]
    Structural(String),

    #[error("Marketplace API error (status={status}): {detail}")]
    Status { status: u16, detail: String },
}

impl ClientError {
    /// Whether the retry engine should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Upstream { .. }
        )
    }

    /// Server-suggested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status attached to the error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Upstream { status, .. } | ClientError::Status { status, .. } => {
                Some(*status)
            }
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
