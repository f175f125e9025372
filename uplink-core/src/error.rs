//! Error types for the uplink data path
//!
//! Provides a unified error type for encryption, erasure coding, piece
//! transport and metadata operations.

use thiserror::Error;

/// Result type alias for uplink operations
pub type Result<T> = std::result::Result<T, UplinkError>;

/// Coarse classification of an [`UplinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Crypto,
    Erasure,
    Transport,
    Metainfo,
    NotFound,
    Cancelled,
    Io,
    Internal,
}

/// Unified error type for the uplink
#[derive(Error, Debug)]
pub enum UplinkError {
    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shares: have {available}, need {required}")]
    InsufficientShares { available: usize, required: usize },

    #[error("Share size mismatch: expected {expected}, got {actual}")]
    ShareSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid share index: {index} (max: {max})")]
    InvalidShareIndex { index: usize, max: usize },

    #[error("Insufficient pieces: got {got} valid pieces, need {required}")]
    InsufficientPieces { got: usize, required: usize },

    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not enough storage nodes: found {available}, need {required}")]
    NotEnoughNodes { available: usize, required: usize },

    #[error("Upload under threshold: {achieved} pieces stored, need {required}")]
    UnderThreshold { achieved: usize, required: usize },

    // ===== Metainfo Errors =====
    #[error("Metainfo error: {0}")]
    Metainfo(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("Bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid range {start}..{end} for object of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },

    // ===== Cancellation =====
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UplinkError {
    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) => ErrorClass::Config,
            Self::Encryption(_) | Self::Decryption(_) | Self::InvalidKeyLength { .. } => {
                ErrorClass::Crypto
            }
            Self::ErasureCoding(_)
            | Self::InsufficientShares { .. }
            | Self::ShareSizeMismatch { .. }
            | Self::InvalidShareIndex { .. }
            | Self::InsufficientPieces { .. } => ErrorClass::Erasure,
            Self::Transport(_) | Self::NotEnoughNodes { .. } | Self::UnderThreshold { .. } => {
                ErrorClass::Transport
            }
            Self::Metainfo(_)
            | Self::BucketAlreadyExists(_)
            | Self::BucketNotEmpty(_)
            | Self::InvalidBucketName(_)
            | Self::InvalidRange { .. } => ErrorClass::Metainfo,
            Self::SegmentNotFound(_) | Self::ObjectNotFound(_) | Self::BucketNotFound(_) => {
                ErrorClass::NotFound
            }
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Cancelled,
            Self::Io(_) => ErrorClass::Io,
            Self::Serialization(_) | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the error reports a missing segment, object or bucket
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

impl From<reed_solomon_erasure::Error> for UplinkError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        UplinkError::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for UplinkError {
    fn from(err: bincode::Error) -> Self {
        UplinkError::Serialization(err.to_string())
    }
}
