//! Reed-Solomon redundancy strategy
//!
//! A segment's ciphertext is split into k data shares and extended with
//! n-k parity shares:
//! - k (required): shares needed to reconstruct
//! - m (repair): fewest pieces an upload may store and still succeed
//! - o (optimal): pieces after which an upload stops waiting
//! - n (total): shares produced per segment
//!
//! Any k distinct shares rebuild the segment.

use crate::crypto::ContentHash;
use crate::error::{Result, UplinkError};
use crate::MAX_SHARES;
use bytes::Bytes;
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Segments whose encoded form exceeds this are hashed in parallel
const PARALLEL_HASH_THRESHOLD: usize = 1024 * 1024;

/// Erasure thresholds and share size of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyScheme {
    /// Shares required to reconstruct (k)
    pub required_shares: usize,
    /// Minimum stored pieces for an upload to succeed (m)
    pub repair_shares: usize,
    /// Pieces after which the upload stops waiting (o)
    pub optimal_shares: usize,
    /// Shares produced (n)
    pub total_shares: usize,
    /// Stripe unit in bytes
    pub share_size: usize,
}

impl RedundancyScheme {
    /// Create a validated scheme
    pub fn new(
        required_shares: usize,
        repair_shares: usize,
        optimal_shares: usize,
        total_shares: usize,
        share_size: usize,
    ) -> Result<Self> {
        let scheme = Self {
            required_shares,
            repair_shares,
            optimal_shares,
            total_shares,
            share_size,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    /// Check `0 < k <= m <= o <= n <= 256` and `share_size > 0`
    pub fn validate(&self) -> Result<()> {
        let (k, m, o, n) = (
            self.required_shares,
            self.repair_shares,
            self.optimal_shares,
            self.total_shares,
        );
        if k == 0 {
            return Err(UplinkError::Configuration(
                "required_shares must be > 0".to_string(),
            ));
        }
        if !(k <= m && m <= o && o <= n) {
            return Err(UplinkError::Configuration(format!(
                "thresholds must satisfy k <= m <= o <= n (got {}/{}/{}/{})",
                k, m, o, n
            )));
        }
        if n > MAX_SHARES {
            return Err(UplinkError::Configuration(format!(
                "total_shares {} exceeds maximum of {}",
                n, MAX_SHARES
            )));
        }
        if self.share_size == 0 {
            return Err(UplinkError::Configuration(
                "share_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes covered by one full stripe (k data shares)
    pub fn stripe_size(&self) -> usize {
        self.required_shares * self.share_size
    }

    /// Size of every piece for a segment of `data_len` bytes
    pub fn piece_size(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.stripe_size()).max(1) * self.share_size
    }

    /// Storage expansion factor (n/k)
    pub fn expansion_factor(&self) -> f64 {
        self.total_shares as f64 / self.required_shares as f64
    }

    /// Pieces that may be lost before the segment becomes unreadable
    pub fn max_failures(&self) -> usize {
        self.total_shares - self.required_shares
    }
}

/// One erasure share of a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Piece number (0..n)
    pub index: u8,
    pub data: Bytes,
    pub hash: ContentHash,
}

impl Share {
    pub fn new(index: u8, data: Bytes) -> Self {
        let hash = ContentHash::compute(&data);
        Self { index, data, hash }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check the share content against its recorded hash
    pub fn verify(&self) -> bool {
        self.hash.verify(&self.data)
    }
}

/// Reed-Solomon encoder/decoder for one scheme
pub struct RedundancyStrategy {
    scheme: RedundancyScheme,
    /// None when n == k (no parity)
    encoder: Option<ReedSolomon>,
}

impl RedundancyStrategy {
    /// Create a strategy; invalid schemes are rejected before any encoding
    pub fn new(scheme: RedundancyScheme) -> Result<Self> {
        scheme.validate()?;
        let parity = scheme.total_shares - scheme.required_shares;
        let encoder = if parity > 0 {
            Some(ReedSolomon::new(scheme.required_shares, parity)?)
        } else {
            None
        };
        Ok(Self { scheme, encoder })
    }

    pub fn scheme(&self) -> &RedundancyScheme {
        &self.scheme
    }

    /// Encode data into n shares of equal size
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Share>> {
        let k = self.scheme.required_shares;
        let n = self.scheme.total_shares;
        let piece_size = self.scheme.piece_size(data.len());

        // Zero-pad to k full pieces
        let mut padded = Vec::with_capacity(piece_size * k);
        padded.extend_from_slice(data);
        padded.resize(piece_size * k, 0);

        let mut shards: Vec<Vec<u8>> = padded.chunks(piece_size).map(|c| c.to_vec()).collect();
        shards.resize(n, vec![0u8; piece_size]);

        if let Some(encoder) = &self.encoder {
            encoder.encode(&mut shards)?;
        }

        let shares = if piece_size * n >= PARALLEL_HASH_THRESHOLD {
            shards
                .into_par_iter()
                .enumerate()
                .map(|(i, shard)| Share::new(i as u8, Bytes::from(shard)))
                .collect()
        } else {
            shards
                .into_iter()
                .enumerate()
                .map(|(i, shard)| Share::new(i as u8, Bytes::from(shard)))
                .collect()
        };

        Ok(shares)
    }

    /// Rebuild the original data from any k distinct shares.
    ///
    /// Duplicate piece numbers are ignored (first one wins). The result is
    /// truncated to `original_size`.
    pub fn decode(&self, shares: &[Share], original_size: usize) -> Result<Bytes> {
        let k = self.scheme.required_shares;
        let n = self.scheme.total_shares;

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut piece_size = None;

        for share in shares {
            let index = share.index as usize;
            if index >= n {
                return Err(UplinkError::InvalidShareIndex {
                    index,
                    max: n - 1,
                });
            }
            match piece_size {
                None => piece_size = Some(share.size()),
                Some(expected) if expected != share.size() => {
                    return Err(UplinkError::ShareSizeMismatch {
                        expected,
                        actual: share.size(),
                    });
                }
                Some(_) => {}
            }
            if slots[index].is_none() {
                slots[index] = Some(share.data.to_vec());
            }
        }

        let available = slots.iter().filter(|s| s.is_some()).count();
        if available < k {
            return Err(UplinkError::InsufficientShares {
                available,
                required: k,
            });
        }

        let piece_size = piece_size.unwrap_or(0);
        if original_size > piece_size * k {
            return Err(UplinkError::ErasureCoding(format!(
                "original size {} exceeds {} shares of {} bytes",
                original_size, k, piece_size
            )));
        }

        let missing_data = slots.iter().take(k).filter(|s| s.is_none()).count();
        if let Some(encoder) = &self.encoder {
            if missing_data > 0 {
                trace!(missing_data, available, "Reconstructing data shares from parity");
            }
            encoder.reconstruct_data(&mut slots)?;
        }

        let mut result = Vec::with_capacity(piece_size * k);
        for slot in slots.iter().take(k) {
            match slot {
                Some(shard) => result.extend_from_slice(shard),
                None => {
                    return Err(UplinkError::Internal("Reconstruction failed".to_string()));
                }
            }
        }

        result.truncate(original_size);
        Ok(Bytes::from(result))
    }
}

impl std::fmt::Debug for RedundancyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundancyStrategy")
            .field("scheme", &self.scheme)
            .finish()
    }
}
