//! Uplink configuration
//!
//! Every section deserializes with defaults, so a partial document is valid:
//! ```toml
//! [rs]
//! min_threshold = 29
//! repair_threshold = 35
//! success_threshold = 80
//! max_threshold = 95
//!
//! [encryption]
//! cipher = "AesGcm"
//! ```
//! Environment variables (`UPLINK_*`) override individual values, see
//! [`UplinkConfig::from_env`].

use crate::crypto::{CipherKind, EncryptionScheme};
use crate::path::PathCipher;
use crate::erasure::RedundancyScheme;
use crate::error::{Result, UplinkError};
use crate::{
    DEFAULT_BLOCK_SIZE, DEFAULT_ERASURE_SHARE_SIZE, DEFAULT_MAX_BUFFER_MEM,
    DEFAULT_MAX_INLINE_SIZE, DEFAULT_SEGMENT_SIZE,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Top-level uplink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default)]
    pub rs: RsConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

/// Reed-Solomon thresholds and upload memory budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsConfig {
    /// k
    #[serde(default = "default_min_threshold")]
    pub min_threshold: usize,
    /// m
    #[serde(default = "default_repair_threshold")]
    pub repair_threshold: usize,
    /// o
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,
    /// n
    #[serde(default = "default_max_threshold")]
    pub max_threshold: usize,
    #[serde(default = "default_erasure_share_size")]
    pub erasure_share_size: usize,
    /// Bytes of piece data that may be in flight at once
    #[serde(default = "default_max_buffer_mem")]
    pub max_buffer_mem: usize,
}

impl Default for RsConfig {
    fn default() -> Self {
        Self {
            min_threshold: default_min_threshold(),
            repair_threshold: default_repair_threshold(),
            success_threshold: default_success_threshold(),
            max_threshold: default_max_threshold(),
            erasure_share_size: default_erasure_share_size(),
            max_buffer_mem: default_max_buffer_mem(),
        }
    }
}

fn default_min_threshold() -> usize {
    29
}

fn default_repair_threshold() -> usize {
    35
}

fn default_success_threshold() -> usize {
    80
}

fn default_max_threshold() -> usize {
    95
}

fn default_erasure_share_size() -> usize {
    DEFAULT_ERASURE_SHARE_SIZE
}

fn default_max_buffer_mem() -> usize {
    DEFAULT_MAX_BUFFER_MEM
}

/// Content encryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_cipher")]
    pub cipher: CipherKind,

    /// Cipher for object keys of new buckets
    #[serde(default)]
    pub path_cipher: PathCipher,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            cipher: default_cipher(),
            path_cipher: PathCipher::default(),
        }
    }
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_cipher() -> CipherKind {
    CipherKind::AesGcm
}

/// Segmentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Plaintext bytes per segment
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// Segments up to this many plaintext bytes are stored inline
    #[serde(default = "default_max_inline_size")]
    pub max_inline_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            max_inline_size: default_max_inline_size(),
        }
    }
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

fn default_max_inline_size() -> usize {
    DEFAULT_MAX_INLINE_SIZE
}

/// Piece transport timeouts, retries and pooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deadline for a single piece upload or download
    #[serde(default = "default_piece_timeout")]
    pub piece_timeout: Duration,

    /// Deadline for all pieces of one segment upload
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout: Duration,

    /// Deadline for gathering k pieces of one segment
    #[serde(default = "default_download_timeout")]
    pub download_timeout: Duration,

    /// How long uploads may keep running once `o` pieces are stored
    #[serde(default = "default_long_tail_grace")]
    pub long_tail_grace: Duration,

    /// Alternate nodes tried per piece after a failure
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Maximum pooled node connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle age after which a pooled connection is dropped
    #[serde(default = "default_stale_connection_secs")]
    pub stale_connection_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Budget for best-effort cleanup after a failed operation
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            piece_timeout: default_piece_timeout(),
            upload_timeout: default_upload_timeout(),
            download_timeout: default_download_timeout(),
            long_tail_grace: default_long_tail_grace(),
            max_retries: default_max_retries(),
            max_connections: default_max_connections(),
            stale_connection_secs: default_stale_connection_secs(),
            connect_timeout: default_connect_timeout(),
            cleanup_timeout: default_cleanup_timeout(),
        }
    }
}

fn default_piece_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_long_tail_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retries() -> usize {
    3
}

fn default_max_connections() -> usize {
    100
}

fn default_stale_connection_secs() -> u64 {
    300
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cleanup_timeout() -> Duration {
    Duration::from_secs(30)
}

impl UplinkConfig {
    /// Small thresholds (4/6/8/10) for development networks
    pub fn dev() -> Self {
        Self {
            rs: RsConfig {
                min_threshold: 4,
                repair_threshold: 6,
                success_threshold: 8,
                max_threshold: 10,
                ..RsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Defaults overridden by `UPLINK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        env_override("UPLINK_RS_MIN_THRESHOLD", &mut config.rs.min_threshold)?;
        env_override("UPLINK_RS_REPAIR_THRESHOLD", &mut config.rs.repair_threshold)?;
        env_override("UPLINK_RS_SUCCESS_THRESHOLD", &mut config.rs.success_threshold)?;
        env_override("UPLINK_RS_MAX_THRESHOLD", &mut config.rs.max_threshold)?;
        env_override("UPLINK_RS_SHARE_SIZE", &mut config.rs.erasure_share_size)?;
        env_override("UPLINK_MAX_BUFFER_MEM", &mut config.rs.max_buffer_mem)?;
        env_override("UPLINK_ENC_BLOCK_SIZE", &mut config.encryption.block_size)?;
        env_override("UPLINK_SEGMENT_SIZE", &mut config.client.segment_size)?;
        env_override("UPLINK_MAX_INLINE_SIZE", &mut config.client.max_inline_size)?;
        env_override("UPLINK_MAX_RETRIES", &mut config.transport.max_retries)?;
        env_override("UPLINK_MAX_CONNECTIONS", &mut config.transport.max_connections)?;

        let mut cipher_code = config.encryption.cipher.code();
        env_override("UPLINK_ENC_CIPHER", &mut cipher_code)?;
        config.encryption.cipher = CipherKind::try_from(cipher_code)?;

        let mut path_cipher_code = config.encryption.path_cipher.code();
        env_override("UPLINK_PATH_CIPHER", &mut path_cipher_code)?;
        config.encryption.path_cipher = PathCipher::try_from(path_cipher_code)?;

        let mut piece_timeout_secs = config.transport.piece_timeout.as_secs();
        env_override("UPLINK_PIECE_TIMEOUT_SECS", &mut piece_timeout_secs)?;
        config.transport.piece_timeout = Duration::from_secs(piece_timeout_secs);

        config.validate()?;
        Ok(config)
    }

    /// Redundancy scheme described by the `rs` section
    pub fn redundancy_scheme(&self) -> Result<RedundancyScheme> {
        RedundancyScheme::new(
            self.rs.min_threshold,
            self.rs.repair_threshold,
            self.rs.success_threshold,
            self.rs.max_threshold,
            self.rs.erasure_share_size,
        )
    }

    /// Encryption scheme described by the `encryption` section
    pub fn encryption_scheme(&self) -> Result<EncryptionScheme> {
        EncryptionScheme::new(self.encryption.cipher, self.encryption.block_size)
    }

    /// Reject inconsistent settings before any I/O happens
    pub fn validate(&self) -> Result<()> {
        let rs = self.redundancy_scheme()?;
        let enc = self.encryption_scheme()?;
        validate_schemes(&rs, &enc)?;

        if self.client.segment_size == 0 {
            return Err(UplinkError::Configuration(
                "segment_size must be > 0".to_string(),
            ));
        }
        if self.rs.max_buffer_mem == 0 {
            return Err(UplinkError::Configuration(
                "max_buffer_mem must be > 0".to_string(),
            ));
        }
        if self.transport.max_connections == 0 {
            return Err(UplinkError::Configuration(
                "max_connections must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A stripe must hold a whole number of encryption blocks
pub fn validate_schemes(rs: &RedundancyScheme, enc: &EncryptionScheme) -> Result<()> {
    rs.validate()?;
    enc.validate()?;
    if rs.stripe_size() % enc.block_size != 0 {
        return Err(UplinkError::Configuration(format!(
            "erasure share size ({}) * required shares ({}) must be a multiple of encryption block size ({})",
            rs.share_size, rs.required_shares, enc.block_size
        )));
    }
    Ok(())
}

fn env_override<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .parse()
            .map_err(|e| UplinkError::Configuration(format!("{}={:?}: {}", name, raw, e)))?;
    }
    Ok(())
}
