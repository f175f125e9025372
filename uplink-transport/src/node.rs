//! Storage node capabilities
//!
//! The uplink consumes node discovery, dialing and the piece protocol through
//! these traits. Secure channel setup happens behind [`Dialer`]; connections
//! it returns are already authenticated.

use crate::error::PieceResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uplink_core::{ContentHash, NodeId, PieceId};

/// Address of a storage node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    pub id: NodeId,
    pub address: String,
}

impl NodeEndpoint {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

/// Node acknowledgement of a stored piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceAck {
    /// Hash of the bytes the node stored
    pub hash: ContentHash,
}

/// Opaque capability token presented with every piece request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Authorization(Bytes);

impl Authorization {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authorization([REDACTED; {}])", self.0.len())
    }
}

/// Node discovery
#[async_trait]
pub trait NodeLookup: Send + Sync {
    /// Up to `count` storage nodes, none of them in `excluded`
    async fn find_storage_nodes(
        &self,
        count: usize,
        excluded: &[NodeId],
    ) -> PieceResult<Vec<NodeEndpoint>>;

    /// Current address of a known node
    async fn resolve(&self, node_id: &NodeId) -> PieceResult<NodeEndpoint>;
}

/// Opens authenticated connections to nodes
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &NodeEndpoint) -> PieceResult<Arc<dyn PieceConnection>>;
}

/// Piece protocol spoken over one node connection
#[async_trait]
pub trait PieceConnection: Send + Sync {
    async fn upload(
        &self,
        piece_id: PieceId,
        authorization: &Authorization,
        data: Bytes,
        expiration: Option<DateTime<Utc>>,
    ) -> PieceResult<PieceAck>;

    async fn download(&self, piece_id: PieceId, authorization: &Authorization)
        -> PieceResult<Bytes>;

    async fn delete(&self, piece_id: PieceId, authorization: &Authorization) -> PieceResult<()>;
}
