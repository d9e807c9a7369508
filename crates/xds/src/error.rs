//! Discovery error types.

use thiserror::Error;

/// Errors surfaced by the discovery engine.
#[derive(Error, Debug)]
pub enum XdsError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown resource type: {0}")]
    UnknownType(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Resource generation failed: {0}")]
    Generate(#[from] GenerateError),

    #[error("Push scheduler is not running")]
    SchedulerStopped,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl XdsError {
    /// Whether the error ends the stream it occurred on.
    ///
    /// Everything else is logged and the offending message dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, XdsError::ConnectionClosed | XdsError::Transport(_))
    }
}

/// Errors raised while producing resources for a proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("no generator registered for {0}")]
    UnknownType(String),

    #[error("{resource} references missing {reference}")]
    MissingReference { resource: String, reference: String },

    #[error("failed to encode {resource}: {message}")]
    Encode { resource: String, message: String },
}
