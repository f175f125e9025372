//! Segment pointers and the identifiers they carry
//!
//! A pointer is the metadata record of one segment: where its ciphertext
//! lives (inline or as erasure-coded pieces on storage nodes), how it was
//! encrypted, and for the last segment of a stream the stream attributes.
//! Pointers refer to segments by key, never by live reference.

use crate::crypto::{ContentHash, EncryptionScheme, KeySalt};
use crate::erasure::RedundancyScheme;
use crate::error::{Result, UplinkError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const PIECE_ID_CONTEXT: &str = "uplink 2019-04-01 derived piece id";

macro_rules! base58_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Generate a random identifier
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Get the raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to base58 string (for logs and display)
            pub fn to_base58(&self) -> String {
                bs58::encode(&self.0).into_string()
            }

            /// Parse from base58 string
            pub fn from_base58(s: &str) -> Result<Self> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| UplinkError::Serialization(e.to_string()))?;

                if bytes.len() != 32 {
                    return Err(UplinkError::Serialization(format!(
                        "Invalid {} length: expected 32, got {}",
                        stringify!($name),
                        bytes.len()
                    )));
                }

                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_base58()[..8])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_base58())
            }
        }
    };
}

base58_id!(
    /// Storage node identifier
    NodeId
);

base58_id!(
    /// Piece identifier. Each segment gets a random root piece id; the id of
    /// piece `i` is derived from the root and `i`.
    PieceId
);

impl NodeId {
    /// Deterministic node id from a seed (test and development networks)
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }
}

impl PieceId {
    /// Derive the id of one piece from this root piece id
    pub fn derive(&self, piece_num: u8) -> PieceId {
        let mut hasher = blake3::Hasher::new_derive_key(PIECE_ID_CONTEXT);
        hasher.update(&self.0);
        hasher.update(&[piece_num]);
        PieceId(*hasher.finalize().as_bytes())
    }
}

/// Path of a stream: `{bucket}/{object key}` for objects, `{bucket}` for
/// bucket records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPath(String);

impl StreamPath {
    pub fn object(bucket: &str, key: &str) -> Self {
        Self(format!("{}/{}", bucket, key))
    }

    pub fn bucket(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bucket component
    pub fn bucket_name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(b, _)| b)
    }

    /// Object key component (None for bucket records)
    pub fn object_key(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, k)| k)
    }
}

impl fmt::Display for StreamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Prefix of last-segment pointer paths
pub const LAST_SEGMENT_PREFIX: &str = "l/";

/// Identifies one segment of a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub stream: StreamPath,
    pub index: u32,
}

impl SegmentKey {
    pub fn new(stream: StreamPath, index: u32) -> Self {
        Self { stream, index }
    }

    /// Pointer path: `l/{stream}` for the last segment, `s{index}/{stream}`
    /// otherwise
    pub fn path(&self, last: bool) -> String {
        if last {
            Self::last_path(&self.stream)
        } else {
            format!("s{}/{}", self.index, self.stream)
        }
    }

    /// Pointer path of the last segment of a stream
    pub fn last_path(stream: &StreamPath) -> String {
        format!("{}{}", LAST_SEGMENT_PREFIX, stream)
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream, self.index)
    }
}

/// Where one piece of a remote segment is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceLocation {
    /// Piece number (0..n)
    pub piece_num: u8,
    pub node_id: NodeId,
    pub size: u64,
    pub hash: ContentHash,
}

/// Erasure-coded segment placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSegment {
    pub scheme: RedundancyScheme,
    pub root_piece_id: PieceId,
    /// Stored pieces, ordered by piece number
    pub pieces: Vec<PieceLocation>,
}

/// Segment ciphertext: embedded or distributed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentPayload {
    Inline(Bytes),
    Remote(RemoteSegment),
}

/// Object attributes, carried by the last segment's pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    /// Plaintext size of the whole stream
    pub size: u64,
    pub segment_count: u32,
    /// Nominal plaintext size of every segment except the last
    pub segment_size: u64,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Blake3 of the plaintext
    pub checksum: ContentHash,
}

impl StreamMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Metadata record of one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    key: SegmentKey,
    key_salt: KeySalt,
    payload: SegmentPayload,
    plain_size: u64,
    encrypted_size: u64,
    encryption: EncryptionScheme,
    last_segment: bool,
    stream_meta: Option<StreamMeta>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Pointer {
    /// Pointer for a segment whose ciphertext is embedded
    pub fn inline(
        key: SegmentKey,
        key_salt: KeySalt,
        ciphertext: Bytes,
        plain_size: u64,
        encryption: EncryptionScheme,
        last_segment: bool,
    ) -> Self {
        let encrypted_size = ciphertext.len() as u64;
        Self {
            key,
            key_salt,
            payload: SegmentPayload::Inline(ciphertext),
            plain_size,
            encrypted_size,
            encryption,
            last_segment,
            stream_meta: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Pointer for an erasure-coded segment
    pub fn remote(
        key: SegmentKey,
        key_salt: KeySalt,
        remote: RemoteSegment,
        plain_size: u64,
        encrypted_size: u64,
        encryption: EncryptionScheme,
        last_segment: bool,
    ) -> Self {
        Self {
            key,
            key_salt,
            payload: SegmentPayload::Remote(remote),
            plain_size,
            encrypted_size,
            encryption,
            last_segment,
            stream_meta: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_stream_meta(mut self, meta: StreamMeta) -> Self {
        self.stream_meta = Some(meta);
        self
    }

    pub fn with_expiration(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn key(&self) -> &SegmentKey {
        &self.key
    }

    /// Salt the segment's content key was drawn with
    pub fn key_salt(&self) -> &KeySalt {
        &self.key_salt
    }

    pub fn payload(&self) -> &SegmentPayload {
        &self.payload
    }

    /// Plaintext size of the segment
    pub fn plain_size(&self) -> u64 {
        self.plain_size
    }

    pub fn encrypted_size(&self) -> u64 {
        self.encrypted_size
    }

    pub fn encryption(&self) -> &EncryptionScheme {
        &self.encryption
    }

    pub fn is_last(&self) -> bool {
        self.last_segment
    }

    pub fn stream_meta(&self) -> Option<&StreamMeta> {
        self.stream_meta.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.payload, SegmentPayload::Inline(_))
    }

    /// Remote segment stored on fewer than `o` pieces
    pub fn is_under_replicated(&self) -> bool {
        match &self.payload {
            SegmentPayload::Inline(_) => false,
            SegmentPayload::Remote(remote) => remote.pieces.len() < remote.scheme.optimal_shares,
        }
    }

    /// Wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
