//! Uplink Core Library
//!
//! Core abstractions for the uplink client data path.
//! This crate provides:
//! - Block-wise authenticated encryption (AES-GCM, XChaCha20-Poly1305)
//! - Per-component object path encryption
//! - Reed-Solomon redundancy with k/m/o/n thresholds
//! - Segment pointers and stream metadata
//! - Configuration, operation context, metrics and error handling

pub mod config;
pub mod context;
pub mod crypto;
pub mod encryption;
pub mod erasure;
pub mod error;
pub mod metrics;
pub mod path;
pub mod pointer;

pub use config::{ClientConfig, EncryptionConfig, RsConfig, TransportConfig, UplinkConfig};
pub use context::OpContext;
pub use crypto::{
    derive_segment_key, derive_stream_key, encrypt_block, BlockCipher, CipherKind, ContentHash,
    EncryptionScheme, Key, KeySalt,
};
pub use encryption::{encrypted_size, Decryptor, Encryptor};
pub use erasure::{RedundancyScheme, RedundancyStrategy, Share};
pub use error::{ErrorClass, Result, UplinkError};
pub use metrics::{InMemoryMetrics, MetricsCollector, NoopMetrics, RecorderMetrics};
pub use path::{PathCipher, PathKey};
pub use pointer::{
    NodeId, PieceId, PieceLocation, Pointer, RemoteSegment, SegmentKey, SegmentPayload,
    StreamMeta, StreamPath,
};

/// Segment size constants
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024; // 64 MB
pub const DEFAULT_MAX_INLINE_SIZE: usize = 4 * 1024; // 4 KB

/// Encryption block size
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Erasure share size and in-flight upload budget
pub const DEFAULT_ERASURE_SHARE_SIZE: usize = 1024;
pub const DEFAULT_MAX_BUFFER_MEM: usize = 4 * 1024 * 1024; // 4 MB

/// Upper bound on total shares (GF(2^8))
pub const MAX_SHARES: usize = 256;
