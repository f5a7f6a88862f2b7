// =============================================================================
// Pipeline Errors
// =============================================================================
//
// Recovery policy per variant:
//   - Decode / decompression: recovered at the message boundary (log + drop).
//   - WorkerFailure: rejects the one pending task, never the pool.
//   - Allocation / IndexOutOfRange: propagate to the caller, they indicate a
//     misconfiguration rather than a transient condition.
//   - Connection: retried by the transport's reconnect policy.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// Every failure the data pipeline can report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to allocate {requested} bytes for ring channel: {reason}")]
    Allocation { requested: usize, reason: String },

    #[error("series index {index} out of range (series count {series_count})")]
    IndexOutOfRange { index: usize, series_count: usize },

    #[error("timed out after {0:?} waiting for data")]
    Timeout(Duration),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("buffer overflow: {requested} bytes requested, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    #[error("worker failure: {0}")]
    WorkerFailure(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        Self::WorkerFailure(msg.into())
    }

    /// Whether the error is confined to a single message and the caller
    /// should simply drop it and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::WorkerFailure(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
