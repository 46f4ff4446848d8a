//! Realtime engine error types.

use thiserror::Error;

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors that can occur inside the realtime engine.
///
/// None of these reach domain collaborators directly: the pipeline turns them
/// into health transitions, counters and log lines.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("storage error: {0}")]
    Storage(#[from] vigil_storage::StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine channel closed")]
    ChannelClosed,

    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl RealtimeError {
    /// True for the contract violations the pipeline drops without retrying.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RealtimeError::Malformed(_) | RealtimeError::UnknownEventType(_)
        )
    }
}
