//! Stream store
//!
//! Splits a byte stream into fixed-size segments stored in order. The last
//! segment lives at `l/{path}` and carries the stream attributes; committing
//! it is what makes the object visible.
//!
//! Uploads hold at most one segment in memory at a time, and only after
//! reserving its share of the transport's upload budget.

use crate::metainfo::ListDirection;
use crate::segments::{SegmentPut, SegmentStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, instrument, warn};
use uplink_core::metrics::names;
use uplink_core::pointer::LAST_SEGMENT_PREFIX;
use uplink_core::{
    derive_segment_key, ContentHash, EncryptionScheme, Key, MetricsCollector, NoopMetrics,
    OpContext, Pointer, RedundancyScheme, Result, SegmentKey, StreamMeta, StreamPath, UplinkConfig,
    UplinkError,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Settings for one object upload
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub segment_size: u64,
    pub redundancy: RedundancyScheme,
    pub encryption: EncryptionScheme,
}

impl PutOptions {
    /// Options with the configured segmentation, redundancy and encryption
    pub fn from_config(config: &UplinkConfig) -> Result<Self> {
        Ok(Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            metadata: BTreeMap::new(),
            expires_at: None,
            segment_size: config.client.segment_size,
            redundancy: config.redundancy_scheme()?,
            encryption: config.encryption_scheme()?,
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_expiration(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }
}

/// One entry of an object listing
#[derive(Debug, Clone)]
pub struct StreamListItem {
    /// Relative to the listed prefix
    pub path: String,
    pub meta: Option<StreamMeta>,
    pub is_prefix: bool,
}

/// One page of an object listing
#[derive(Debug, Clone, Default)]
pub struct StreamListPage {
    pub items: Vec<StreamListItem>,
    pub more: bool,
}

/// Stores whole objects as ordered segments
#[derive(Clone)]
pub struct StreamStore {
    segments: SegmentStore,
    root_key: Arc<Key>,
    metrics: Arc<dyn MetricsCollector>,
}

impl StreamStore {
    pub fn new(segments: SegmentStore, root_key: Arc<Key>) -> Self {
        Self {
            segments,
            root_key,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    /// Upload an object, replacing any existing one at `path`
    #[instrument(skip(self, ctx, reader, opts), fields(path = %path))]
    pub async fn put<R>(
        &self,
        ctx: &OpContext,
        path: &StreamPath,
        reader: R,
        opts: PutOptions,
    ) -> Result<StreamMeta>
    where
        R: AsyncRead + Unpin + Send,
    {
        ctx.check()?;
        if opts.segment_size == 0 {
            return Err(UplinkError::Configuration(
                "segment_size must be > 0".to_string(),
            ));
        }
        opts.redundancy.validate()?;

        match self.delete(ctx, path).await {
            Ok(()) => debug!("Replaced existing object"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let start = Instant::now();
        let mut committed = Vec::new();
        match self
            .put_segments(ctx, path, reader, &opts, &mut committed)
            .await
        {
            Ok(meta) => {
                info!(
                    size = meta.size,
                    segments = meta.segment_count,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Object stored"
                );
                Ok(meta)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    committed = committed.len(),
                    "Object upload failed, removing stored segments"
                );
                self.cleanup(&committed).await;
                Err(err)
            }
        }
    }

    /// Store segments in order; `committed` collects interior segments as
    /// they land
    async fn put_segments<R>(
        &self,
        ctx: &OpContext,
        path: &StreamPath,
        reader: R,
        opts: &PutOptions,
        committed: &mut Vec<SegmentKey>,
    ) -> Result<StreamMeta>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = BufReader::new(reader);
        let cost = segment_cost(opts);
        let mut hasher = blake3::Hasher::new();
        let mut size = 0u64;
        let mut index = 0u32;

        loop {
            // Released once the segment is stored
            let _reservation = self.segments.transport().reserve(ctx, cost).await?;
            let current = read_segment(ctx, &mut reader, opts.segment_size).await?;
            let last =
                (current.len() as u64) < opts.segment_size || at_end(ctx, &mut reader).await?;

            hasher.update(&current);
            size += current.len() as u64;

            let key = SegmentKey::new(path.clone(), index);
            let segment_key = derive_segment_key(&self.root_key, path.as_str(), index);

            if last {
                let meta = StreamMeta {
                    size,
                    segment_count: index + 1,
                    segment_size: opts.segment_size,
                    content_type: opts.content_type.clone(),
                    metadata: opts.metadata.clone(),
                    created_at: Utc::now(),
                    expires_at: opts.expires_at,
                    checksum: ContentHash::from_hasher(&hasher),
                };
                self.segments
                    .put_segment(
                        ctx,
                        key,
                        &segment_key,
                        &current,
                        SegmentPut {
                            last: true,
                            stream_meta: Some(meta.clone()),
                            expiration: opts.expires_at,
                            redundancy: opts.redundancy,
                            encryption: opts.encryption,
                        },
                    )
                    .await?;
                return Ok(meta);
            }

            self.segments
                .put_segment(
                    ctx,
                    key.clone(),
                    &segment_key,
                    &current,
                    SegmentPut {
                        last: false,
                        stream_meta: None,
                        expiration: opts.expires_at,
                        redundancy: opts.redundancy,
                        encryption: opts.encryption,
                    },
                )
                .await?;
            committed.push(key);

            index = index.checked_add(1).ok_or_else(|| {
                UplinkError::Configuration("object has too many segments".to_string())
            })?;
        }
    }

    /// Remove the interior segments of an abandoned upload
    async fn cleanup(&self, committed: &[SegmentKey]) {
        if committed.is_empty() {
            return;
        }
        let timeout = self.segments.transport().config().cleanup_timeout;
        let ctx = OpContext::with_timeout(timeout);
        for key in committed {
            if let Err(err) = self.segments.delete_segment(&ctx, key, false).await {
                warn!(segment = %key, error = %err, "Cleanup of segment failed");
                self.metrics.increment(names::CLEANUP_FAILURES, 1);
            }
        }
    }

    /// Stream attributes plus a lazy stream of the requested bytes.
    ///
    /// Only segments overlapping `range` are fetched, one per poll.
    #[instrument(skip(self, ctx), fields(path = %path))]
    pub async fn get(
        &self,
        ctx: &OpContext,
        path: &StreamPath,
        range: Option<Range<u64>>,
    ) -> Result<(StreamMeta, BoxStream<'static, Result<Bytes>>)> {
        let (last_pointer, meta) = self.last_segment(ctx, path).await?;

        let range = match range {
            None => 0..meta.size,
            Some(range) => {
                if range.start >= range.end || range.end > meta.size {
                    return Err(UplinkError::InvalidRange {
                        start: range.start,
                        end: range.end,
                        size: meta.size,
                    });
                }
                range
            }
        };

        let plan = segment_plan(&meta, &range);
        debug!(segments = plan.len(), "Planned segment reads");

        let reader = SegmentReader {
            store: self.clone(),
            ctx: ctx.clone(),
            path: path.clone(),
            last_index: meta.segment_count.saturating_sub(1),
            last_pointer,
            plan: plan.into_iter(),
        };

        let stream = stream::unfold(Some(reader), |state| async move {
            let mut reader = match state {
                Some(reader) => reader,
                None => return None,
            };
            let (index, local) = reader.plan.next()?;
            match reader.fetch(index, local).await {
                Ok(bytes) => Some((Ok(bytes), Some(reader))),
                // The first failure ends the stream
                Err(err) => Some((Err(err), None)),
            }
        });

        Ok((meta, stream.boxed()))
    }

    /// Stream attributes of an object
    pub async fn meta(&self, ctx: &OpContext, path: &StreamPath) -> Result<StreamMeta> {
        self.last_segment(ctx, path).await.map(|(_, meta)| meta)
    }

    /// Delete an object. The last segment goes first so the object
    /// disappears at once; interior segments are removed best-effort.
    #[instrument(skip(self, ctx), fields(path = %path))]
    pub async fn delete(&self, ctx: &OpContext, path: &StreamPath) -> Result<()> {
        let last_key_path = SegmentKey::last_path(path);
        let pointer = ctx
            .run(self.segments.pointers().get_pointer(&last_key_path))
            .await?
            .ok_or_else(|| UplinkError::ObjectNotFound(path.to_string()))?;
        let segment_count = pointer
            .stream_meta()
            .map_or(1, |meta| meta.segment_count.max(1));

        let last_index = segment_count - 1;
        self.segments
            .delete_segment(ctx, &SegmentKey::new(path.clone(), last_index), true)
            .await?;

        for index in 0..last_index {
            let key = SegmentKey::new(path.clone(), index);
            if let Err(err) = self.segments.delete_segment(ctx, &key, false).await {
                if matches!(
                    err,
                    UplinkError::Cancelled | UplinkError::DeadlineExceeded
                ) {
                    return Err(err);
                }
                warn!(segment = %key, error = %err, "Failed to delete segment");
            }
        }

        info!(segments = segment_count, "Object deleted");
        Ok(())
    }

    /// Objects under `prefix` (a stream path prefix such as `bucket/dir/`)
    /// on the `direction` side of `cursor`. Expired objects are skipped.
    pub async fn list(
        &self,
        ctx: &OpContext,
        prefix: &str,
        cursor: Option<&str>,
        direction: ListDirection,
        recursive: bool,
        limit: usize,
    ) -> Result<StreamListPage> {
        let listing_prefix = format!("{}{}", LAST_SEGMENT_PREFIX, prefix);
        let page = ctx
            .run(self.segments.pointers().list_pointers(
                &listing_prefix,
                cursor,
                direction,
                recursive,
                limit,
            ))
            .await?;

        let now = Utc::now();
        let items = page
            .items
            .into_iter()
            .filter_map(|item| {
                let meta = item.pointer.as_ref().and_then(|p| p.stream_meta().cloned());
                if meta.as_ref().is_some_and(|m| m.is_expired(now)) {
                    return None;
                }
                Some(StreamListItem {
                    path: item.path,
                    meta,
                    is_prefix: item.is_prefix,
                })
            })
            .collect();

        Ok(StreamListPage {
            items,
            more: page.more,
        })
    }

    /// Whether anything is stored under `prefix`, expired objects included
    pub async fn has_objects(&self, ctx: &OpContext, prefix: &str) -> Result<bool> {
        let listing_prefix = format!("{}{}", LAST_SEGMENT_PREFIX, prefix);
        let page = ctx
            .run(self.segments.pointers().list_pointers(
                &listing_prefix,
                None,
                ListDirection::After,
                true,
                1,
            ))
            .await?;
        Ok(!page.items.is_empty())
    }

    /// Content of a one-segment object from its already fetched last pointer
    pub async fn read_single(
        &self,
        ctx: &OpContext,
        path: &StreamPath,
        pointer: &Pointer,
    ) -> Result<Bytes> {
        let segment_count = pointer.stream_meta().map(|meta| meta.segment_count);
        if segment_count != Some(1) {
            return Err(UplinkError::Metainfo(format!(
                "{} is not a single-segment object",
                path
            )));
        }
        let segment_key = derive_segment_key(&self.root_key, path.as_str(), 0);
        self.segments
            .get_segment(ctx, pointer, &segment_key, None)
            .await
    }

    /// Last-segment pointer and stream attributes of a live object
    async fn last_segment(&self, ctx: &OpContext, path: &StreamPath) -> Result<(Pointer, StreamMeta)> {
        let pointer = ctx
            .run(
                self.segments
                    .pointers()
                    .get_pointer(&SegmentKey::last_path(path)),
            )
            .await?
            .ok_or_else(|| UplinkError::ObjectNotFound(path.to_string()))?;

        let meta = pointer.stream_meta().cloned().ok_or_else(|| {
            UplinkError::Metainfo(format!("last segment of {} has no stream attributes", path))
        })?;

        if meta.is_expired(Utc::now()) {
            debug!(path = %path, "Object expired");
            return Err(UplinkError::ObjectNotFound(path.to_string()));
        }

        Ok((pointer, meta))
    }
}

/// Segment indices and in-segment ranges covering `range`
fn segment_plan(meta: &StreamMeta, range: &Range<u64>) -> Vec<(u32, Range<u64>)> {
    // An empty object is one empty segment
    if meta.size == 0 {
        return vec![(0, 0..0)];
    }
    if range.start >= range.end {
        return Vec::new();
    }

    let segment_size = meta.segment_size.max(1);
    let first = range.start / segment_size;
    let last = (range.end - 1) / segment_size;

    (first..=last)
        .map(|index| {
            let segment_start = index * segment_size;
            let local_start = range.start.max(segment_start) - segment_start;
            let local_end = range.end.min(segment_start + segment_size) - segment_start;
            (index as u32, local_start..local_end)
        })
        .collect()
}

/// Memory one buffered segment needs: plaintext, ciphertext and all shares
fn segment_cost(opts: &PutOptions) -> usize {
    let plain = usize::try_from(opts.segment_size).unwrap_or(usize::MAX);
    let encrypted = usize::try_from(opts.encryption.encrypted_size(opts.segment_size))
        .unwrap_or(usize::MAX);
    let scheme = &opts.redundancy;
    let shares = encrypted
        .div_ceil(scheme.stripe_size().max(1))
        .max(1)
        .saturating_mul(scheme.share_size)
        .saturating_mul(scheme.total_shares);
    plain.saturating_add(encrypted).saturating_add(shares)
}

/// True once the reader has nothing left
async fn at_end<R>(ctx: &OpContext, reader: &mut BufReader<R>) -> Result<bool>
where
    R: AsyncRead + Unpin + Send,
{
    ctx.run(async {
        reader
            .fill_buf()
            .await
            .map(|buf| buf.is_empty())
            .map_err(UplinkError::from)
    })
    .await
}

/// Fill one segment from the reader; short only at end of stream
async fn read_segment<R>(ctx: &OpContext, reader: &mut R, segment_size: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(segment_size);
    ctx.run(async {
        limited
            .read_to_end(&mut buf)
            .await
            .map_err(UplinkError::from)
    })
    .await?;
    Ok(buf)
}

/// State of a lazy object download
struct SegmentReader {
    store: StreamStore,
    ctx: OpContext,
    path: StreamPath,
    last_index: u32,
    last_pointer: Pointer,
    plan: std::vec::IntoIter<(u32, Range<u64>)>,
}

impl SegmentReader {
    async fn fetch(&self, index: u32, local: Range<u64>) -> Result<Bytes> {
        let segments = &self.store.segments;
        let key = SegmentKey::new(self.path.clone(), index);

        let fetched;
        let pointer = if index == self.last_index {
            &self.last_pointer
        } else {
            fetched = segments
                .pointer(&self.ctx, &key, false)
                .await?
                .ok_or_else(|| UplinkError::SegmentNotFound(key.path(false)))?;
            &fetched
        };

        let segment_key = derive_segment_key(&self.store.root_key, self.path.as_str(), index);
        segments
            .get_segment(&self.ctx, pointer, &segment_key, Some(local))
            .await
    }
}
