//! Typed errors for the tracker's subsystem boundaries.
//!
//! Store access propagates `anyhow::Error` with context; the AI client gets
//! a typed enum so callers can tell a missing-configuration precondition
//! apart from an upstream failure.

use thiserror::Error;

/// Errors from the text-generation client.
#[derive(Debug, Error)]
pub enum AiError {
    /// Precondition: no API key configured. Raised at client construction,
    /// before any network call.
    #[error("AI_API_KEY is not set")]
    MissingApiKey,

    #[error("Text-generation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Text-generation endpoint returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Malformed text-generation response: {0}")]
    MalformedResponse(String),
}

impl AiError {
    /// True for the fail-fast configuration error, as opposed to upstream
    /// failures that degrade to a failed job.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::MissingApiKey)
    }
}
