//! Error taxonomy for transfers and coordination.

use thiserror::Error;

/// Errors raised by the transfer pipeline.
///
/// Callers branch on the kind: only [`TransferError::TransientNetwork`] is
/// retried, everything else fails the current item or task.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection failure, timeout, 5xx or truncated payload.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The relay answered with a structured failure or an unusable shape.
    #[error("relay protocol error: {0}")]
    Protocol(String),

    /// A blocked content frame could not be handed to the user.
    #[error("content blocked: {0}")]
    BlockedContent(String),

    /// Lease or queue state disagreed with this worker's view.
    #[error("coordination timeout: {0}")]
    CoordinationTimeout(String),

    /// A chunk plan or content set that cannot produce output.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    /// Whether a bounded retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Classify a `reqwest` failure.
    ///
    /// Transport-level problems are transient; decode failures mean the
    /// peer sent something we do not understand.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(format!("undecodable response: {err}"))
        } else {
            Self::TransientNetwork(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = body.trim();
        let snippet: String = body.chars().take(200).collect();
        if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
            Self::TransientNetwork(format!("HTTP {status}: {snippet}"))
        } else {
            Self::Protocol(format!("HTTP {status}: {snippet}"))
        }
    }
}
