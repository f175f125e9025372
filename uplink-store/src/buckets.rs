//! Buckets
//!
//! A bucket is a small stream at path `{name}` whose content is the bucket's
//! settings. Objects of the bucket live under `{name}/`.

use crate::metainfo::ListDirection;
use crate::streams::{PutOptions, StreamStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};
use uplink_core::pointer::LAST_SEGMENT_PREFIX;
use uplink_core::{
    EncryptionScheme, OpContext, PathCipher, Pointer, RedundancyScheme, Result, StreamPath,
    UplinkError,
};

/// Content type of bucket records
pub const BUCKET_CONTENT_TYPE: &str = "application/x-uplink-bucket";

/// Maximum bucket name length
pub const MAX_BUCKET_NAME_LEN: usize = 63;

/// Pointers fetched per metadata round trip while listing buckets
const LIST_BATCH: usize = 100;

/// Defaults applied to objects uploaded into a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    pub segment_size: u64,
    pub redundancy: RedundancyScheme,
    pub encryption: EncryptionScheme,
    pub path_cipher: PathCipher,
}

/// Stored bucket record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    pub segment_size: u64,
    pub redundancy: RedundancyScheme,
    pub encryption: EncryptionScheme,
    /// How object keys are stored; fixed at creation
    pub path_cipher: PathCipher,
}

impl BucketInfo {
    pub fn settings(&self) -> BucketSettings {
        BucketSettings {
            segment_size: self.segment_size,
            redundancy: self.redundancy,
            encryption: self.encryption,
            path_cipher: self.path_cipher,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Bucket listing request
#[derive(Debug, Clone, Default)]
pub struct BucketListOptions {
    /// Bucket name to list from
    pub cursor: Option<String>,
    pub direction: ListDirection,
    /// 0 means no limit
    pub limit: usize,
}

/// One page of a bucket listing, in name order
#[derive(Debug, Clone, Default)]
pub struct BucketPage {
    pub buckets: Vec<BucketInfo>,
    pub more: bool,
}

/// Check a bucket name: 1-63 characters, no `/`, no leading `.`
pub fn validate_bucket_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > MAX_BUCKET_NAME_LEN {
        "longer than 63 characters"
    } else if name.contains('/') {
        "contains '/'"
    } else if name.starts_with('.') {
        "starts with '.'"
    } else {
        return Ok(());
    };
    Err(UplinkError::InvalidBucketName(format!("{:?}: {}", name, reason)))
}

/// Bucket records on top of the stream store
#[derive(Clone)]
pub struct BucketStore {
    streams: StreamStore,
}

impl BucketStore {
    pub fn new(streams: StreamStore) -> Self {
        Self { streams }
    }

    #[instrument(skip(self, ctx, settings))]
    pub async fn create(
        &self,
        ctx: &OpContext,
        name: &str,
        settings: BucketSettings,
    ) -> Result<BucketInfo> {
        validate_bucket_name(name)?;
        settings.redundancy.validate()?;
        settings.encryption.validate()?;
        if settings.segment_size == 0 {
            return Err(UplinkError::Configuration(
                "segment_size must be > 0".to_string(),
            ));
        }

        let path = StreamPath::bucket(name);
        match self.streams.meta(ctx, &path).await {
            Ok(_) => return Err(UplinkError::BucketAlreadyExists(name.to_string())),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let info = BucketInfo {
            name: name.to_string(),
            created: Utc::now(),
            segment_size: settings.segment_size,
            redundancy: settings.redundancy,
            encryption: settings.encryption,
            path_cipher: settings.path_cipher,
        };
        let record = info.to_bytes()?;

        let opts = PutOptions {
            content_type: BUCKET_CONTENT_TYPE.to_string(),
            metadata: BTreeMap::new(),
            expires_at: None,
            // The record is always read back as a single segment
            segment_size: settings.segment_size.max(record.len() as u64),
            redundancy: settings.redundancy,
            encryption: settings.encryption,
        };
        self.streams.put(ctx, &path, record.as_slice(), opts).await?;

        info!(bucket = name, path_cipher = %info.path_cipher, "Bucket created");
        Ok(info)
    }

    #[instrument(skip(self, ctx))]
    pub async fn get(&self, ctx: &OpContext, name: &str) -> Result<BucketInfo> {
        validate_bucket_name(name)?;
        let path = StreamPath::bucket(name);

        let (_, stream) = self
            .streams
            .get(ctx, &path, None)
            .await
            .map_err(|err| not_found_as_bucket(err, name))?;
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        BucketInfo::from_bytes(&chunks.concat())
    }

    /// Delete an empty bucket
    #[instrument(skip(self, ctx))]
    pub async fn delete(&self, ctx: &OpContext, name: &str) -> Result<()> {
        validate_bucket_name(name)?;
        let path = StreamPath::bucket(name);

        self.streams
            .meta(ctx, &path)
            .await
            .map_err(|err| not_found_as_bucket(err, name))?;

        // Expired objects still hold pointers and pieces
        if self.streams.has_objects(ctx, &format!("{}/", name)).await? {
            return Err(UplinkError::BucketNotEmpty(name.to_string()));
        }

        self.streams
            .delete(ctx, &path)
            .await
            .map_err(|err| not_found_as_bucket(err, name))?;

        info!(bucket = name, "Bucket deleted");
        Ok(())
    }

    /// Buckets on the `direction` side of the cursor. Records are decoded
    /// from the listed pointers; object prefixes sharing the namespace are
    /// skipped.
    pub async fn list(&self, ctx: &OpContext, opts: &BucketListOptions) -> Result<BucketPage> {
        let pointers = self.streams.segments().pointers();
        let mut cursor = opts.cursor.clone();
        let mut direction = opts.direction;
        let mut page = BucketPage::default();

        'pages: loop {
            let listing = ctx
                .run(pointers.list_pointers(
                    LAST_SEGMENT_PREFIX,
                    cursor.as_deref(),
                    direction,
                    false,
                    LIST_BATCH,
                ))
                .await?;

            let outermost = if direction.is_backward() {
                listing.items.first()
            } else {
                listing.items.last()
            };
            let next_cursor = outermost.map(|item| item.path.clone());
            let listing_more = listing.more;

            let mut items = listing.items;
            // Nearest to the cursor first, so a limit keeps the closest buckets
            if direction.is_backward() {
                items.reverse();
            }
            for item in items {
                if item.is_prefix {
                    continue;
                }
                let Some(pointer) = item.pointer else {
                    continue;
                };
                if opts.limit > 0 && page.buckets.len() == opts.limit {
                    page.more = true;
                    break 'pages;
                }
                page.buckets.push(self.decode(ctx, &item.path, &pointer).await?);
            }

            match next_cursor {
                Some(next) if listing_more => {
                    cursor = Some(next);
                    direction = direction.continuation();
                }
                _ => break,
            }
        }

        if direction.is_backward() {
            page.buckets.reverse();
        }
        debug!(buckets = page.buckets.len(), more = page.more, "Listed buckets");
        Ok(page)
    }

    /// Bucket record held in an already listed pointer
    async fn decode(&self, ctx: &OpContext, name: &str, pointer: &Pointer) -> Result<BucketInfo> {
        let record = self
            .streams
            .read_single(ctx, &StreamPath::bucket(name), pointer)
            .await?;
        BucketInfo::from_bytes(&record)
    }
}

fn not_found_as_bucket(err: UplinkError, name: &str) -> UplinkError {
    if err.is_not_found() {
        UplinkError::BucketNotFound(name.to_string())
    } else {
        err
    }
}
