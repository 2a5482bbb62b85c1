//! Error types for relay operations
//!
//! One crate-wide error enum with classification for retry decisions.

use thiserror::Error;

/// Errors raised by the relay control plane.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error (invalid settings, unknown consumer tag)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event-bus publish failure
    #[error("Publish error for destination '{destination}': {reason}")]
    Publish { destination: String, reason: String },

    /// Offset store failure
    #[error("Offset store error: {0}")]
    Offset(String),

    /// Lock manager failure
    #[error("Lock error: {0}")]
    Lock(String),

    /// Log-tailing engine failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// Snapshot phase has run past the snapshot window
    ///
    /// Raised by the snapshot consumer when a non-snapshot record shows up.
    /// Terminal for the snapshot phase, not for the pipeline.
    #[error("Snapshot phase complete: encountered {op} for destination '{destination}'")]
    SnapshotComplete { destination: String, op: String },

    /// Commit callback failure reported by the engine
    #[error("Commit error: {0}")]
    Commit(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stop/close did not finish within the grace period
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl RelayError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new publish error
    pub fn publish(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publish {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    /// Create a new offset store error
    pub fn offset(msg: impl Into<String>) -> Self {
        Self::Offset(msg.into())
    }

    /// Create a new lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a new engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a new commit error
    pub fn commit(msg: impl Into<String>) -> Self {
        Self::Commit(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Retriable errors resolve themselves by restarting the pipeline from
    /// the last committed offset; non-retriable ones need operator action.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Publish { .. } | Self::Lock(_) | Self::Engine(_) | Self::Timeout(_) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            Self::Config(_)
            | Self::Offset(_)
            | Self::SnapshotComplete { .. }
            | Self::Commit(_)
            | Self::Json(_) => false,
        }
    }

    /// True when the error marks the end of the snapshot window.
    pub fn is_snapshot_complete(&self) -> bool {
        matches!(self, Self::SnapshotComplete { .. })
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
