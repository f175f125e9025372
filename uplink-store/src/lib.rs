//! Uplink Store
//!
//! Object storage on top of the piece transport:
//! - Pointer persistence through the `PointerStore` capability
//! - Segment store: inline or erasure-coded segments
//! - Stream store: objects split into ordered segments
//! - Buckets and the session entry point, with per-bucket path encryption

pub mod buckets;
pub mod metainfo;
pub mod segments;
pub mod session;
pub mod streams;

pub use buckets::{
    validate_bucket_name, BucketInfo, BucketListOptions, BucketPage, BucketSettings, BucketStore,
};
pub use metainfo::{ListDirection, ListItem, ListPage, MemoryPointerStore, PointerStore};
pub use segments::{SegmentPut, SegmentStore};
pub use session::{
    ListObjectsConfig, ListObjectsFields, ObjectList, ObjectMeta, ObjectPutOpts, Session,
};
pub use streams::{PutOptions, StreamListItem, StreamListPage, StreamStore};
