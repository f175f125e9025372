//! Session
//!
//! Entry point of the uplink. A session owns the connection pool, metrics
//! collector, root key and stores; every call takes an [`OpContext`].
//!
//! Object keys are stored encrypted with their bucket's path cipher. Bucket
//! records are cached per session, so object calls on a known bucket cost no
//! extra metadata reads.

use crate::buckets::{BucketInfo, BucketListOptions, BucketPage, BucketSettings, BucketStore};
use crate::metainfo::{ListDirection, PointerStore};
use crate::segments::SegmentStore;
use crate::streams::{PutOptions, StreamListItem, StreamStore, DEFAULT_CONTENT_TYPE};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};
use uplink_core::config::validate_schemes;
use uplink_core::metrics::describe_metrics;
use uplink_core::{
    ContentHash, EncryptionScheme, Key, MetricsCollector, OpContext, PathKey, RecorderMetrics,
    RedundancyScheme, Result, StreamMeta, StreamPath, UplinkConfig, UplinkError,
};
use uplink_transport::{Authorization, ConnectionPool, Dialer, NodeLookup, PieceTransport};

/// Per-upload overrides of the bucket defaults
#[derive(Debug, Clone, Default)]
pub struct ObjectPutOpts {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub segment_size: Option<u64>,
    pub redundancy: Option<RedundancyScheme>,
    pub encryption: Option<EncryptionScheme>,
}

/// Which object attributes a listing fills in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListObjectsFields {
    #[default]
    PathOnly,
    Modified,
    Expiration,
    Size,
    Checksum,
    UserDefined,
    All,
}

impl ListObjectsFields {
    pub fn modified(self) -> bool {
        matches!(self, Self::Modified | Self::All)
    }

    pub fn expiration(self) -> bool {
        matches!(self, Self::Expiration | Self::All)
    }

    pub fn size(self) -> bool {
        matches!(self, Self::Size | Self::All)
    }

    pub fn checksum(self) -> bool {
        matches!(self, Self::Checksum | Self::All)
    }

    pub fn user_defined(self) -> bool {
        matches!(self, Self::UserDefined | Self::All)
    }
}

/// Object listing request
#[derive(Debug, Clone, Default)]
pub struct ListObjectsConfig {
    /// Key prefix within the bucket. With an encrypted path cipher it must
    /// be empty or end in `/`.
    pub prefix: String,
    /// Key relative to `prefix` the listing starts from
    pub cursor: Option<String>,
    /// Side of the cursor to list; results always come back in path order
    pub direction: ListDirection,
    pub recursive: bool,
    /// 0 means no limit
    pub limit: usize,
    pub fields: ListObjectsFields,
}

/// Object attributes as returned to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub is_prefix: bool,
    pub content_type: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub checksum: Option<ContentHash>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ObjectMeta {
    fn from_stream(bucket: &str, key: &str, meta: &StreamMeta, fields: ListObjectsFields) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            is_prefix: false,
            content_type: fields.user_defined().then(|| meta.content_type.clone()),
            created: fields.modified().then_some(meta.created_at),
            expires: if fields.expiration() { meta.expires_at } else { None },
            size: fields.size().then_some(meta.size),
            checksum: fields.checksum().then_some(meta.checksum),
            metadata: fields.user_defined().then(|| meta.metadata.clone()),
        }
    }

    fn prefix(bucket: &str, key: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            is_prefix: true,
            content_type: None,
            created: None,
            expires: None,
            size: None,
            checksum: None,
            metadata: None,
        }
    }
}

/// One page of an object listing
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<ObjectMeta>,
    pub more: bool,
}

/// Uplink session
pub struct Session {
    config: UplinkConfig,
    pool: Arc<ConnectionPool>,
    metrics: Arc<dyn MetricsCollector>,
    root_key: Arc<Key>,
    streams: StreamStore,
    buckets: BucketStore,
    bucket_cache: RwLock<HashMap<String, BucketInfo>>,
}

impl Session {
    /// Session reporting to the `metrics` facade
    pub fn new(
        config: UplinkConfig,
        root_key: Key,
        lookup: Arc<dyn NodeLookup>,
        dialer: Arc<dyn Dialer>,
        pointers: Arc<dyn PointerStore>,
    ) -> Result<Self> {
        describe_metrics();
        Self::with_metrics(
            config,
            root_key,
            lookup,
            dialer,
            pointers,
            Arc::new(RecorderMetrics),
        )
    }

    pub fn with_metrics(
        config: UplinkConfig,
        root_key: Key,
        lookup: Arc<dyn NodeLookup>,
        dialer: Arc<dyn Dialer>,
        pointers: Arc<dyn PointerStore>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Result<Self> {
        Self::open(
            config,
            root_key,
            lookup,
            dialer,
            pointers,
            metrics,
            Authorization::default(),
        )
    }

    /// Session presenting `authorization` with every piece request
    pub fn open(
        config: UplinkConfig,
        root_key: Key,
        lookup: Arc<dyn NodeLookup>,
        dialer: Arc<dyn Dialer>,
        pointers: Arc<dyn PointerStore>,
        metrics: Arc<dyn MetricsCollector>,
        authorization: Authorization,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(dialer, &config.transport));
        let transport = Arc::new(
            PieceTransport::new(
                lookup,
                pool.clone(),
                config.transport.clone(),
                config.rs.max_buffer_mem,
            )
            .with_authorization(authorization)
            .with_metrics(metrics.clone()),
        );
        let segments = SegmentStore::new(pointers, transport, config.client.max_inline_size)
            .with_metrics(metrics.clone());
        let root_key = Arc::new(root_key);
        let streams = StreamStore::new(segments, root_key.clone()).with_metrics(metrics.clone());
        let buckets = BucketStore::new(streams.clone());

        info!(
            k = config.rs.min_threshold,
            m = config.rs.repair_threshold,
            o = config.rs.success_threshold,
            n = config.rs.max_threshold,
            cipher = %config.encryption.cipher,
            path_cipher = %config.encryption.path_cipher,
            "Uplink session ready"
        );

        Ok(Self {
            config,
            pool,
            metrics,
            root_key,
            streams,
            buckets,
            bucket_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics
    }

    pub fn streams(&self) -> &StreamStore {
        &self.streams
    }

    /// Bucket settings from the session configuration
    pub fn default_bucket_settings(&self) -> Result<BucketSettings> {
        Ok(BucketSettings {
            segment_size: self.config.client.segment_size,
            redundancy: self.config.redundancy_scheme()?,
            encryption: self.config.encryption_scheme()?,
            path_cipher: self.config.encryption.path_cipher,
        })
    }

    // =========================================================================
    // BUCKET OPERATIONS
    // =========================================================================

    /// Create a bucket with the session defaults
    pub async fn create_bucket(&self, ctx: &OpContext, name: &str) -> Result<BucketInfo> {
        let settings = self.default_bucket_settings()?;
        self.create_bucket_with(ctx, name, settings).await
    }

    pub async fn create_bucket_with(
        &self,
        ctx: &OpContext,
        name: &str,
        settings: BucketSettings,
    ) -> Result<BucketInfo> {
        validate_schemes(&settings.redundancy, &settings.encryption)?;
        let info = self.buckets.create(ctx, name, settings).await?;
        self.bucket_cache
            .write()
            .insert(name.to_string(), info.clone());
        Ok(info)
    }

    /// Bucket record read from the metadata service
    pub async fn get_bucket(&self, ctx: &OpContext, name: &str) -> Result<BucketInfo> {
        let info = self.buckets.get(ctx, name).await?;
        self.bucket_cache
            .write()
            .insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub async fn delete_bucket(&self, ctx: &OpContext, name: &str) -> Result<()> {
        self.bucket_cache.write().remove(name);
        self.buckets.delete(ctx, name).await
    }

    pub async fn list_buckets(&self, ctx: &OpContext, opts: BucketListOptions) -> Result<BucketPage> {
        self.buckets.list(ctx, &opts).await
    }

    /// Bucket record, from the cache when this session has seen it
    async fn bucket_info(&self, ctx: &OpContext, name: &str) -> Result<BucketInfo> {
        let cached = self.bucket_cache.read().get(name).cloned();
        match cached {
            Some(info) => Ok(info),
            None => self.get_bucket(ctx, name).await,
        }
    }

    fn path_key(&self, info: &BucketInfo) -> PathKey {
        PathKey::for_bucket(info.path_cipher, &self.root_key, &info.name)
    }

    /// Stored stream path of an object key
    async fn object_path(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<StreamPath> {
        validate_object_key(key)?;
        let info = self.bucket_info(ctx, bucket).await?;
        let encrypted = self.path_key(&info).encrypt(key)?;
        Ok(StreamPath::object(bucket, &encrypted))
    }

    // =========================================================================
    // OBJECT OPERATIONS
    // =========================================================================

    /// Upload an object. Settings not given in `opts` come from the bucket.
    #[instrument(skip(self, ctx, reader, opts))]
    pub async fn upload<R>(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        reader: R,
        opts: ObjectPutOpts,
    ) -> Result<ObjectMeta>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_object_key(key)?;
        let info = self.bucket_info(ctx, bucket).await?;

        let redundancy = opts.redundancy.unwrap_or(info.redundancy);
        let encryption = opts.encryption.unwrap_or(info.encryption);
        validate_schemes(&redundancy, &encryption)?;

        let put = PutOptions {
            content_type: opts
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            metadata: opts.metadata,
            expires_at: opts.expires_at,
            segment_size: opts.segment_size.unwrap_or(info.segment_size),
            redundancy,
            encryption,
        };

        let path = StreamPath::object(bucket, &self.path_key(&info).encrypt(key)?);
        let meta = self.streams.put(ctx, &path, reader, put).await?;
        Ok(ObjectMeta::from_stream(bucket, key, &meta, ListObjectsFields::All))
    }

    /// Object attributes plus a lazy stream of its bytes (or of `range`)
    pub async fn download(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<(ObjectMeta, BoxStream<'static, Result<Bytes>>)> {
        let path = self.object_path(ctx, bucket, key).await?;
        let (meta, stream) = self.streams.get(ctx, &path, range).await?;
        Ok((
            ObjectMeta::from_stream(bucket, key, &meta, ListObjectsFields::All),
            stream,
        ))
    }

    /// Whole object (or `range`) collected in memory
    pub async fn download_bytes(
        &self,
        ctx: &OpContext,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        let (_, stream) = self.download(ctx, bucket, key, range).await?;
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }

    pub async fn object_meta(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let path = self.object_path(ctx, bucket, key).await?;
        let meta = self.streams.meta(ctx, &path).await?;
        Ok(ObjectMeta::from_stream(bucket, key, &meta, ListObjectsFields::All))
    }

    pub async fn delete_object(&self, ctx: &OpContext, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(ctx, bucket, key).await?;
        self.streams.delete(ctx, &path).await
    }

    /// List objects of a bucket. Keys of an encrypted bucket come back in
    /// the order of their encrypted form.
    pub async fn list_objects(
        &self,
        ctx: &OpContext,
        bucket: &str,
        config: ListObjectsConfig,
    ) -> Result<ObjectList> {
        // A missing bucket is an error, not an empty list
        let info = self.bucket_info(ctx, bucket).await?;
        let path_key = self.path_key(&info);
        let below = path_key.descend(&config.prefix)?;

        let prefix = format!("{}/{}", bucket, path_key.encrypt(&config.prefix)?);
        let cursor = config
            .cursor
            .as_deref()
            .map(|cursor| below.encrypt(cursor))
            .transpose()?;
        let page = self
            .streams
            .list(
                ctx,
                &prefix,
                cursor.as_deref(),
                config.direction,
                config.recursive,
                config.limit,
            )
            .await?;

        let items = page
            .items
            .into_iter()
            .map(|item| object_from_listing(bucket, &config, &below, item))
            .collect::<Result<Vec<_>>>()?;

        debug!(bucket, items = items.len(), more = page.more, "Listed objects");
        Ok(ObjectList {
            items,
            more: page.more,
        })
    }
}

fn object_from_listing(
    bucket: &str,
    config: &ListObjectsConfig,
    path_key: &PathKey,
    item: StreamListItem,
) -> Result<ObjectMeta> {
    let key = format!("{}{}", config.prefix, path_key.decrypt(&item.path)?);
    Ok(match item.meta {
        Some(meta) if !item.is_prefix => ObjectMeta::from_stream(bucket, &key, &meta, config.fields),
        _ => ObjectMeta::prefix(bucket, &key),
    })
}

fn validate_object_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(UplinkError::Metainfo(
            "object key must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_meta() -> StreamMeta {
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "alice".to_string());
        StreamMeta {
            size: 42,
            segment_count: 1,
            segment_size: 1024,
            content_type: "text/plain".to_string(),
            metadata,
            created_at: Utc::now(),
            expires_at: None,
            checksum: ContentHash::compute(b"data"),
        }
    }

    #[test]
    fn test_path_only_fields() {
        let meta = ObjectMeta::from_stream("b", "k", &stream_meta(), ListObjectsFields::PathOnly);
        assert_eq!(meta.key, "k");
        assert!(meta.size.is_none());
        assert!(meta.created.is_none());
        assert!(meta.metadata.is_none());
    }

    #[test]
    fn test_selected_fields() {
        let source = stream_meta();

        let sized = ObjectMeta::from_stream("b", "k", &source, ListObjectsFields::Size);
        assert_eq!(sized.size, Some(42));
        assert!(sized.checksum.is_none());

        let user = ObjectMeta::from_stream("b", "k", &source, ListObjectsFields::UserDefined);
        assert_eq!(user.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            user.metadata.unwrap().get("owner").map(String::as_str),
            Some("alice")
        );

        let all = ObjectMeta::from_stream("b", "k", &source, ListObjectsFields::All);
        assert_eq!(all.checksum, Some(source.checksum));
        assert_eq!(all.created, Some(source.created_at));
    }
}
