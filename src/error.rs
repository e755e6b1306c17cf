//! Typed error hierarchy for shoal
//!
//! Every error carries enough context to decide whether the operation can
//! be retried or has to be surfaced to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the node
#[derive(Debug, Error)]
pub enum NodeError {
    /// Unknown file or chunk reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// Chunk index out of range for the file
    #[error("Invalid chunk index {index} (file has {chunk_count} chunks)")]
    InvalidIndex { index: u32, chunk_count: u32 },

    /// Integrity failure on a chunk or a whole file
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Merge attempted with a chunk slot still empty
    #[error("Missing chunk {index}, cannot assemble file")]
    MissingChunk { index: u32 },

    /// A lookup cannot even be sent
    #[error("No peers available")]
    NoPeers,

    /// No response within a fetch attempt's deadline
    #[error("Timed out waiting for {what}")]
    Timeout { what: &'static str },

    /// Unparsable wire input
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// A download finished its retry budget with chunks still missing
    #[error("Download incomplete: {} chunks missing", missing.len())]
    Incomplete { missing: Vec<u32> },

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Filesystem or socket I/O failure
    #[error("I/O error at {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    /// Node is shutting down
    #[error("Node is shutting down")]
    Shutdown,
}

impl NodeError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io { .. })
    }

    /// Create an I/O error with path context
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a malformed-message error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
