//! Segment store
//!
//! Stores one segment at a time: small segments are encrypted into their
//! pointer, larger ones are encrypted, erasure coded and spread over storage
//! nodes before the pointer is committed.
//!
//! Every put draws a fresh key salt, kept in the pointer, so rewriting the
//! same path never reuses a content key with the same block nonces.

use crate::metainfo::PointerStore;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uplink_core::encryption::encrypt_segment;
use uplink_core::metrics::names;
use uplink_core::{
    BlockCipher, Decryptor, EncryptionScheme, Key, KeySalt, MetricsCollector, NoopMetrics,
    OpContext, PieceId, Pointer, RedundancyScheme, RedundancyStrategy, RemoteSegment, Result, SegmentKey,
    SegmentPayload, StreamMeta,
};
use uplink_transport::{PieceTransport, UploadRequest};

/// Per-segment upload settings
#[derive(Debug, Clone)]
pub struct SegmentPut {
    pub last: bool,
    /// Set on the last segment only
    pub stream_meta: Option<StreamMeta>,
    pub expiration: Option<DateTime<Utc>>,
    pub redundancy: RedundancyScheme,
    pub encryption: EncryptionScheme,
}

/// Stores and fetches individual segments
#[derive(Clone)]
pub struct SegmentStore {
    pointers: Arc<dyn PointerStore>,
    transport: Arc<PieceTransport>,
    max_inline_size: usize,
    metrics: Arc<dyn MetricsCollector>,
}

impl SegmentStore {
    pub fn new(
        pointers: Arc<dyn PointerStore>,
        transport: Arc<PieceTransport>,
        max_inline_size: usize,
    ) -> Self {
        Self {
            pointers,
            transport,
            max_inline_size,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pointers(&self) -> &Arc<dyn PointerStore> {
        &self.pointers
    }

    pub fn transport(&self) -> &Arc<PieceTransport> {
        &self.transport
    }

    pub fn max_inline_size(&self) -> usize {
        self.max_inline_size
    }

    /// Encrypt and store one segment, then commit its pointer
    #[instrument(
        skip(self, ctx, segment_key, plaintext, put),
        fields(segment = %key, size = plaintext.len(), last = put.last)
    )]
    pub async fn put_segment(
        &self,
        ctx: &OpContext,
        key: SegmentKey,
        segment_key: &Key,
        plaintext: &[u8],
        put: SegmentPut,
    ) -> Result<Pointer> {
        ctx.check()?;
        put.encryption.validate()?;
        let start = Instant::now();
        let plain_size = plaintext.len() as u64;

        let key_salt = KeySalt::random();
        let content_key = key_salt.content_key(segment_key);
        let cipher = BlockCipher::new(put.encryption.cipher, content_key.as_bytes())?;
        let ciphertext = encrypt_segment(cipher, put.encryption.block_size, plaintext)?;
        self.metrics.increment(
            names::BLOCKS_ENCRYPTED,
            put.encryption.block_count(plain_size),
        );

        let pointer = if plaintext.len() <= self.max_inline_size {
            debug!("Storing segment inline");
            self.metrics.increment(names::SEGMENTS_INLINE, 1);
            Pointer::inline(
                key.clone(),
                key_salt,
                ciphertext,
                plain_size,
                put.encryption,
                put.last,
            )
        } else {
            let strategy = RedundancyStrategy::new(put.redundancy)?;
            let encrypted_size = ciphertext.len() as u64;
            let shares = strategy.encode(&ciphertext)?;
            let root_piece_id = PieceId::random();

            let outcome = self
                .transport
                .upload(
                    ctx,
                    UploadRequest {
                        root_piece_id,
                        shares,
                        scheme: put.redundancy,
                        expiration: put.expiration,
                    },
                )
                .await?;

            if outcome.under_replicated {
                warn!(
                    stored = outcome.pieces.len(),
                    optimal = put.redundancy.optimal_shares,
                    "Segment stored under-replicated"
                );
                self.metrics.increment(names::SEGMENTS_UNDER_REPLICATED, 1);
            }

            Pointer::remote(
                key.clone(),
                key_salt,
                RemoteSegment {
                    scheme: put.redundancy,
                    root_piece_id,
                    pieces: outcome.pieces,
                },
                plain_size,
                encrypted_size,
                put.encryption,
                put.last,
            )
        };

        let mut pointer = pointer.with_expiration(put.expiration);
        if let Some(meta) = put.stream_meta {
            pointer = pointer.with_stream_meta(meta);
        }

        let path = key.path(put.last);
        if let Err(err) = ctx.run(self.pointers.put_pointer(&path, &pointer)).await {
            warn!(error = %err, path = %path, "Pointer commit failed");
            self.discard_pieces(&pointer).await;
            return Err(err);
        }

        let elapsed = start.elapsed();
        self.metrics.increment(names::SEGMENTS_UPLOADED, 1);
        self.metrics.increment(names::BYTES_UPLOADED, plain_size);
        self.metrics
            .observe(names::UPLOAD_DURATION, elapsed.as_secs_f64());
        info!(
            path = %path,
            inline = pointer.is_inline(),
            latency_ms = elapsed.as_millis() as u64,
            "Segment committed"
        );

        Ok(pointer)
    }

    /// Plaintext of a segment, or of `range` within it
    #[instrument(skip(self, ctx, pointer, segment_key), fields(segment = %pointer.key()))]
    pub async fn get_segment(
        &self,
        ctx: &OpContext,
        pointer: &Pointer,
        segment_key: &Key,
        range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        ctx.check()?;
        let start = Instant::now();

        let ciphertext = match pointer.payload() {
            SegmentPayload::Inline(data) => data.clone(),
            SegmentPayload::Remote(remote) => {
                let strategy = RedundancyStrategy::new(remote.scheme)?;
                let shares = self
                    .transport
                    .download(ctx, remote.root_piece_id, &remote.pieces, &remote.scheme)
                    .await?;
                strategy.decode(&shares, pointer.encrypted_size() as usize)?
            }
        };

        let content_key = pointer.key_salt().content_key(segment_key);
        let cipher = BlockCipher::new(pointer.encryption().cipher, content_key.as_bytes())?;
        let decryptor = Decryptor::new(
            cipher,
            *pointer.encryption(),
            ciphertext,
            pointer.plain_size(),
        )?;

        let range = range.unwrap_or(0..pointer.plain_size());
        let blocks = decryptor.covering_blocks(&range);
        let plaintext = decryptor.decrypt_range(range)?;

        let elapsed = start.elapsed();
        self.metrics
            .increment(names::BLOCKS_DECRYPTED, blocks.end - blocks.start);
        self.metrics.increment(names::SEGMENTS_DOWNLOADED, 1);
        self.metrics
            .increment(names::BYTES_DOWNLOADED, plaintext.len() as u64);
        self.metrics
            .observe(names::DOWNLOAD_DURATION, elapsed.as_secs_f64());
        debug!(
            size = plaintext.len(),
            blocks = blocks.end - blocks.start,
            "Segment read"
        );

        Ok(plaintext)
    }

    /// Delete a segment and its pieces. A missing segment is not an error.
    #[instrument(skip(self, ctx), fields(segment = %key))]
    pub async fn delete_segment(&self, ctx: &OpContext, key: &SegmentKey, last: bool) -> Result<()> {
        let path = key.path(last);
        let pointer = match ctx.run(self.pointers.get_pointer(&path)).await? {
            Some(pointer) => pointer,
            None => {
                debug!(path = %path, "Segment already gone");
                return Ok(());
            }
        };

        if let SegmentPayload::Remote(remote) = pointer.payload() {
            let deleted = self
                .transport
                .delete(ctx, remote.root_piece_id, &remote.pieces)
                .await;
            if deleted < remote.pieces.len() {
                debug!(
                    deleted,
                    total = remote.pieces.len(),
                    "Some pieces were left on nodes"
                );
            }
        }

        ctx.run(self.pointers.delete_pointer(&path)).await?;
        self.metrics.increment(names::SEGMENTS_DELETED, 1);
        debug!(path = %path, "Segment deleted");
        Ok(())
    }

    /// Pointer of a segment, if committed
    pub async fn pointer(
        &self,
        ctx: &OpContext,
        key: &SegmentKey,
        last: bool,
    ) -> Result<Option<Pointer>> {
        ctx.run(self.pointers.get_pointer(&key.path(last))).await
    }

    async fn discard_pieces(&self, pointer: &Pointer) {
        if let SegmentPayload::Remote(remote) = pointer.payload() {
            let cleanup = OpContext::with_timeout(self.transport.config().cleanup_timeout);
            let deleted = self
                .transport
                .delete(&cleanup, remote.root_piece_id, &remote.pieces)
                .await;
            if deleted < remote.pieces.len() {
                self.metrics.increment(
                    names::CLEANUP_FAILURES,
                    (remote.pieces.len() - deleted) as u64,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MemoryPointerStore;
    use std::time::Duration;
    use uplink_core::{derive_segment_key, CipherKind, InMemoryMetrics, StreamPath, TransportConfig};
    use uplink_transport::{ConnectionPool, MemoryNetwork, NodeBehavior};

    const MAX_INLINE: usize = 4096;

    struct Fixture {
        network: Arc<MemoryNetwork>,
        pointers: Arc<MemoryPointerStore>,
        metrics: Arc<InMemoryMetrics>,
        store: SegmentStore,
    }

    fn fixture() -> Fixture {
        let network = Arc::new(MemoryNetwork::with_nodes(10));
        let config = TransportConfig {
            long_tail_grace: Duration::from_millis(50),
            ..TransportConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new(network.clone(), &config));
        let metrics = Arc::new(InMemoryMetrics::new());
        let transport = Arc::new(
            PieceTransport::new(network.clone(), pool, config, 4 * 1024 * 1024)
                .with_metrics(metrics.clone()),
        );
        let pointers = Arc::new(MemoryPointerStore::new());
        let store = SegmentStore::new(pointers.clone(), transport, MAX_INLINE)
            .with_metrics(metrics.clone());
        Fixture {
            network,
            pointers,
            metrics,
            store,
        }
    }

    fn put(last: bool) -> SegmentPut {
        SegmentPut {
            last,
            stream_meta: None,
            expiration: None,
            redundancy: RedundancyScheme::new(4, 6, 8, 10, 256).unwrap(),
            encryption: EncryptionScheme::new(CipherKind::AesGcm, 1024).unwrap(),
        }
    }

    fn key(index: u32) -> (SegmentKey, Key) {
        let root = Key::from_bytes([3u8; 32]);
        let stream = StreamPath::object("bucket", "object");
        let content_key = derive_segment_key(&root, stream.as_str(), index);
        (SegmentKey::new(stream, index), content_key)
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_inline_boundary() {
        let f = fixture();
        let ctx = OpContext::new();

        let (k0, c0) = key(0);
        let inline = f
            .store
            .put_segment(&ctx, k0, &c0, &data(MAX_INLINE), put(false))
            .await
            .unwrap();
        assert!(inline.is_inline());
        assert_eq!(f.network.total_pieces(), 0);

        let (k1, c1) = key(1);
        let remote = f
            .store
            .put_segment(&ctx, k1, &c1, &data(MAX_INLINE + 1), put(false))
            .await
            .unwrap();
        assert!(!remote.is_inline());
        assert!(f.network.total_pieces() >= 8);
        assert_eq!(f.metrics.counter(names::SEGMENTS_INLINE), 1);
        assert_eq!(f.metrics.counter(names::SEGMENTS_UPLOADED), 2);
    }

    #[tokio::test]
    async fn test_remote_roundtrip_and_range() {
        let f = fixture();
        let ctx = OpContext::new();
        let (k, c) = key(0);
        let plaintext = data(10_000);

        let pointer = f
            .store
            .put_segment(&ctx, k.clone(), &c, &plaintext, put(true))
            .await
            .unwrap();
        assert!(f.pointers.contains(&k.path(true)));
        assert_eq!(pointer.plain_size(), 10_000);

        let all = f.store.get_segment(&ctx, &pointer, &c, None).await.unwrap();
        assert_eq!(all.as_ref(), plaintext.as_slice());

        f.metrics.reset();
        let part = f
            .store
            .get_segment(&ctx, &pointer, &c, Some(2050..2060))
            .await
            .unwrap();
        assert_eq!(part.as_ref(), &plaintext[2050..2060]);
        assert_eq!(f.metrics.counter(names::BLOCKS_DECRYPTED), 1);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let f = fixture();
        let ctx = OpContext::new();
        let (k, c) = key(0);
        let (_, other) = key(1);

        let pointer = f
            .store
            .put_segment(&ctx, k, &c, b"secret", put(true))
            .await
            .unwrap();
        let result = f.store.get_segment(&ctx, &pointer, &other, None).await;
        assert!(matches!(result, Err(uplink_core::UplinkError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        let ctx = OpContext::new();
        let (k, c) = key(0);

        f.store
            .put_segment(&ctx, k.clone(), &c, &data(8000), put(false))
            .await
            .unwrap();
        assert!(f.network.total_pieces() > 0);

        f.store.delete_segment(&ctx, &k, false).await.unwrap();
        assert_eq!(f.network.total_pieces(), 0);
        assert!(f.pointers.is_empty());

        f.store.delete_segment(&ctx, &k, false).await.unwrap();
        assert!(f.store.pointer(&ctx, &k, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_under_replicated_segment_counted() {
        let f = fixture();
        for node in &f.network.nodes()[..3] {
            node.set_behavior(NodeBehavior::FailUploads);
        }
        let (k, c) = key(0);

        let pointer = f
            .store
            .put_segment(&OpContext::new(), k, &c, &data(8000), put(true))
            .await
            .unwrap();
        assert!(pointer.is_under_replicated());
        assert_eq!(f.metrics.counter(names::SEGMENTS_UNDER_REPLICATED), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_commits_nothing() {
        let f = fixture();
        for node in &f.network.nodes()[..5] {
            node.set_behavior(NodeBehavior::FailUploads);
        }
        let (k, c) = key(0);

        let result = f
            .store
            .put_segment(&OpContext::new(), k, &c, &data(8000), put(true))
            .await;
        assert!(matches!(
            result,
            Err(uplink_core::UplinkError::UnderThreshold { .. })
        ));
        assert!(f.pointers.is_empty());
        assert_eq!(f.network.total_pieces(), 0);
    }

    #[tokio::test]
    async fn test_rewrite_uses_fresh_keystream() {
        let f = fixture();
        let ctx = OpContext::new();
        let (k, c) = key(0);
        let first = data(2000);
        let second: Vec<u8> = first.iter().map(|b| b ^ 0x5a).collect();

        let p1 = f
            .store
            .put_segment(&ctx, k.clone(), &c, &first, put(true))
            .await
            .unwrap();
        let p2 = f
            .store
            .put_segment(&ctx, k, &c, &second, put(true))
            .await
            .unwrap();
        assert_ne!(p1.key_salt(), p2.key_salt());

        let payloads = (p1.payload(), p2.payload());
        let (SegmentPayload::Inline(ct1), SegmentPayload::Inline(ct2)) = payloads else {
            panic!("expected inline segments");
        };
        // Block 0 ciphertext lines up with plaintext bytes 0..1024
        let xor = |a: &[u8], b: &[u8]| -> Vec<u8> { a.iter().zip(b).map(|(x, y)| x ^ y).collect() };
        assert_ne!(xor(&ct1[..1024], &ct2[..1024]), xor(&first[..1024], &second[..1024]));

        let back = f.store.get_segment(&ctx, &p2, &c, None).await.unwrap();
        assert_eq!(back.as_ref(), second.as_slice());
    }

    #[tokio::test]
    async fn test_zero_block_size_rejected() {
        let f = fixture();
        let (k, c) = key(0);
        let mut settings = put(true);
        settings.encryption.block_size = 0;

        let result = f
            .store
            .put_segment(&OpContext::new(), k, &c, b"data", settings)
            .await;
        assert!(matches!(
            result,
            Err(uplink_core::UplinkError::Configuration(_))
        ));
        assert!(f.pointers.is_empty());
    }
}
