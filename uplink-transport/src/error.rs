//! Per-piece transport errors
//!
//! These stay inside the transport: a failed piece is retried on another
//! node or counted against the thresholds. Only segment-level outcomes are
//! surfaced as [`UplinkError`].

use uplink_core::{NodeId, PieceId, UplinkError};

/// Result of a single piece operation
pub type PieceResult<T> = std::result::Result<T, PieceError>;

/// Error types for piece operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PieceError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    #[error("Node unknown: {0}")]
    NodeUnknown(NodeId),

    #[error("Rejected by node: {0}")]
    Rejected(String),

    #[error("Piece not found: {0}")]
    NotFound(PieceId),

    #[error("Hash mismatch: {0}")]
    HashMismatch(String),

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Piece operation timed out")]
    Timeout,

    #[error("Node lookup failed: {0}")]
    Lookup(String),
}

impl PieceError {
    /// Whether the cached connection to the node should be dropped
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PieceError::ConnectionFailed(_) | PieceError::Unreachable(_) | PieceError::Timeout
        )
    }
}

impl From<PieceError> for UplinkError {
    fn from(err: PieceError) -> Self {
        UplinkError::Transport(err.to_string())
    }
}
