//! In-memory storage node network
//!
//! Used for testing and development. Nodes keep pieces in a map and can be
//! told to misbehave.

use crate::error::{PieceError, PieceResult};
use crate::node::{
    Authorization, Dialer, NodeEndpoint, NodeLookup, PieceAck, PieceConnection,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uplink_core::{ContentHash, NodeId, PieceId};

/// How a node responds to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBehavior {
    Healthy,
    /// Rejects every upload
    FailUploads,
    /// Fails every download
    FailDownloads,
    /// Cannot be dialed; cached connections fail too
    Unreachable,
    /// Never answers
    Hang,
    /// Answers after a delay
    Delay(Duration),
    /// Returns pieces with a flipped byte
    CorruptDownloads,
    /// Stores pieces but acknowledges the wrong hash
    BadAck,
}

/// In-memory storage node
pub struct MemoryNode {
    id: NodeId,
    address: String,
    behavior: RwLock<NodeBehavior>,
    pieces: RwLock<HashMap<PieceId, Bytes>>,

    /// Operation counters
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    cancelled: AtomicU64,
}

impl MemoryNode {
    fn new(index: usize, behavior: NodeBehavior) -> Self {
        Self {
            id: NodeId::from_seed(format!("memory-node-{}", index).as_bytes()),
            address: format!("memory://node-{}", index),
            behavior: RwLock::new(behavior),
            pieces: RwLock::new(HashMap::new()),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint::new(self.id, self.address.clone())
    }

    pub fn behavior(&self) -> NodeBehavior {
        *self.behavior.read()
    }

    pub fn set_behavior(&self, behavior: NodeBehavior) {
        *self.behavior.write() = behavior;
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.read().len()
    }

    pub fn has_piece(&self, piece_id: &PieceId) -> bool {
        self.pieces.read().contains_key(piece_id)
    }

    /// Successful uploads
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Successful downloads
    pub fn downloads(&self) -> u64 {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Successful deletes
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Requests dropped by the caller before the node answered
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Apply the behavior shared by every request. Returns once the node is
    /// ready to answer.
    async fn respond(&self) -> PieceResult<NodeBehavior> {
        let behavior = self.behavior();
        match behavior {
            NodeBehavior::Unreachable => {
                return Err(PieceError::ConnectionFailed(format!(
                    "{} stopped responding",
                    self.address
                )))
            }
            NodeBehavior::Hang => std::future::pending::<()>().await,
            NodeBehavior::Delay(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }
        Ok(behavior)
    }
}

/// Counts a request as cancelled if it is dropped before finishing
struct InFlight<'a> {
    node: &'a MemoryNode,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn new(node: &'a MemoryNode) -> Self {
        Self {
            node,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.node.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PieceConnection for MemoryNode {
    async fn upload(
        &self,
        piece_id: PieceId,
        _authorization: &Authorization,
        data: Bytes,
        _expiration: Option<DateTime<Utc>>,
    ) -> PieceResult<PieceAck> {
        let guard = InFlight::new(self);
        let result = self.respond().await;
        guard.finish();

        let hash = match result? {
            NodeBehavior::FailUploads => {
                return Err(PieceError::Rejected(format!(
                    "{} refused piece {}",
                    self.address, piece_id
                )))
            }
            NodeBehavior::BadAck => ContentHash::compute(b"not the stored piece"),
            _ => ContentHash::compute(&data),
        };

        self.pieces.write().insert(piece_id, data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(PieceAck { hash })
    }

    async fn download(
        &self,
        piece_id: PieceId,
        _authorization: &Authorization,
    ) -> PieceResult<Bytes> {
        let guard = InFlight::new(self);
        let result = self.respond().await;
        guard.finish();

        let behavior = result?;
        if behavior == NodeBehavior::FailDownloads {
            return Err(PieceError::ConnectionFailed(format!(
                "{} dropped download of {}",
                self.address, piece_id
            )));
        }

        let data = self
            .pieces
            .read()
            .get(&piece_id)
            .cloned()
            .ok_or(PieceError::NotFound(piece_id))?;

        self.downloads.fetch_add(1, Ordering::SeqCst);
        if behavior == NodeBehavior::CorruptDownloads && !data.is_empty() {
            let mut corrupted = data.to_vec();
            corrupted[0] ^= 0xFF;
            return Ok(Bytes::from(corrupted));
        }
        Ok(data)
    }

    async fn delete(&self, piece_id: PieceId, _authorization: &Authorization) -> PieceResult<()> {
        let guard = InFlight::new(self);
        let result = self.respond().await;
        guard.finish();
        result?;

        self.pieces
            .write()
            .remove(&piece_id)
            .ok_or(PieceError::NotFound(piece_id))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A set of in-memory nodes acting as both lookup service and dialer
pub struct MemoryNetwork {
    nodes: RwLock<Vec<Arc<MemoryNode>>>,
    dials: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            dials: AtomicU64::new(0),
        }
    }

    /// Network of `count` healthy nodes
    pub fn with_nodes(count: usize) -> Self {
        let network = Self::new();
        for _ in 0..count {
            network.add_node(NodeBehavior::Healthy);
        }
        network
    }

    pub fn add_node(&self, behavior: NodeBehavior) -> Arc<MemoryNode> {
        let mut nodes = self.nodes.write();
        let node = Arc::new(MemoryNode::new(nodes.len(), behavior));
        nodes.push(node.clone());
        node
    }

    /// Nodes in the order lookups return them
    pub fn nodes(&self) -> Vec<Arc<MemoryNode>> {
        self.nodes.read().clone()
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<MemoryNode>> {
        self.nodes.read().iter().find(|n| n.id == *id).cloned()
    }

    /// Pieces stored across all nodes
    pub fn total_pieces(&self) -> usize {
        self.nodes.read().iter().map(|n| n.piece_count()).sum()
    }

    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeLookup for MemoryNetwork {
    async fn find_storage_nodes(
        &self,
        count: usize,
        excluded: &[NodeId],
    ) -> PieceResult<Vec<NodeEndpoint>> {
        Ok(self
            .nodes
            .read()
            .iter()
            .filter(|n| !excluded.contains(&n.id))
            .take(count)
            .map(|n| n.endpoint())
            .collect())
    }

    async fn resolve(&self, node_id: &NodeId) -> PieceResult<NodeEndpoint> {
        self.node(node_id)
            .map(|n| n.endpoint())
            .ok_or(PieceError::NodeUnknown(*node_id))
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, endpoint: &NodeEndpoint) -> PieceResult<Arc<dyn PieceConnection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let node = self
            .node(&endpoint.id)
            .ok_or(PieceError::NodeUnknown(endpoint.id))?;
        if node.behavior() == NodeBehavior::Unreachable {
            return Err(PieceError::Unreachable(endpoint.id));
        }
        Ok(node as Arc<dyn PieceConnection>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_fetch() {
        let network = MemoryNetwork::with_nodes(1);
        let node = network.nodes()[0].clone();
        let auth = Authorization::default();
        let piece_id = PieceId::random();

        let ack = node
            .upload(piece_id, &auth, Bytes::from_static(b"piece"), None)
            .await
            .unwrap();
        assert_eq!(ack.hash, ContentHash::compute(b"piece"));
        assert!(node.has_piece(&piece_id));

        let data = node.download(piece_id, &auth).await.unwrap();
        assert_eq!(data.as_ref(), b"piece");

        node.delete(piece_id, &auth).await.unwrap();
        assert!(matches!(
            node.delete(piece_id, &auth).await,
            Err(PieceError::NotFound(_))
        ));
        assert_eq!(node.uploads(), 1);
        assert_eq!(node.deletes(), 1);
    }

    #[tokio::test]
    async fn test_lookup_excludes() {
        let network = MemoryNetwork::with_nodes(5);
        let ids: Vec<NodeId> = network.nodes().iter().map(|n| n.id()).collect();

        let found = network.find_storage_nodes(10, &ids[..2]).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|e| !ids[..2].contains(&e.id)));

        assert!(matches!(
            network.resolve(&NodeId::from_seed(b"nobody")).await,
            Err(PieceError::NodeUnknown(_))
        ));
    }

    #[tokio::test]
    async fn test_misbehaving_nodes() {
        let network = MemoryNetwork::new();
        let auth = Authorization::default();
        let data = Bytes::from_static(b"payload");

        let failing = network.add_node(NodeBehavior::FailUploads);
        assert!(matches!(
            failing.upload(PieceId::random(), &auth, data.clone(), None).await,
            Err(PieceError::Rejected(_))
        ));

        let bad_ack = network.add_node(NodeBehavior::BadAck);
        let ack = bad_ack
            .upload(PieceId::random(), &auth, data.clone(), None)
            .await
            .unwrap();
        assert_ne!(ack.hash, ContentHash::compute(&data));

        let corrupt = network.add_node(NodeBehavior::CorruptDownloads);
        let piece_id = PieceId::random();
        corrupt.upload(piece_id, &auth, data.clone(), None).await.unwrap();
        assert_ne!(corrupt.download(piece_id, &auth).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_hanging_request_counted_as_cancelled() {
        let network = MemoryNetwork::new();
        let node = network.add_node(NodeBehavior::Hang);
        let auth = Authorization::default();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            node.upload(PieceId::random(), &auth, Bytes::from_static(b"x"), None),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(node.cancelled(), 1);
        assert_eq!(node.piece_count(), 0);
    }
}
