//! Node connection pool
//!
//! Caches one connection per node. Safe for concurrent use; owned by a
//! session and shared by `Arc`.

use crate::error::{PieceError, PieceResult};
use crate::node::{Dialer, NodeEndpoint, PieceConnection};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uplink_core::{NodeId, TransportConfig};

/// A pooled connection with last-used tracking
struct PooledConnection {
    conn: Arc<dyn PieceConnection>,
    last_used: Instant,
}

/// Pool of node connections
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,

    /// Maximum number of cached connections
    max_connections: usize,

    /// Evict connections unused for this long
    stale_after: Duration,

    connect_timeout: Duration,

    /// Connection pool: node id -> pooled connection
    connections: RwLock<HashMap<NodeId, PooledConnection>>,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn Dialer>, config: &TransportConfig) -> Self {
        Self {
            dialer,
            max_connections: config.max_connections.max(1),
            stale_after: Duration::from_secs(config.stale_connection_secs),
            connect_timeout: config.connect_timeout,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a connection to a storage node
    pub async fn get(&self, endpoint: &NodeEndpoint) -> PieceResult<Arc<dyn PieceConnection>> {
        // Check if we have an existing connection
        {
            let mut connections = self.connections.write().await;
            if let Some(pooled) = connections.get_mut(&endpoint.id) {
                pooled.last_used = Instant::now();
                return Ok(pooled.conn.clone());
            }
        }

        debug!(node = %endpoint.id, address = %endpoint.address, "Connecting to storage node");
        let conn = tokio::time::timeout(self.connect_timeout, self.dialer.dial(endpoint))
            .await
            .map_err(|_| PieceError::Timeout)??;

        // Store the connection, evicting stale entries if at capacity
        {
            let mut connections = self.connections.write().await;

            let now = Instant::now();
            let stale_after = self.stale_after;
            connections.retain(|id, pooled| {
                let keep = now.duration_since(pooled.last_used) < stale_after;
                if !keep {
                    debug!(node = %id, "Evicting stale connection");
                }
                keep
            });

            // If still at capacity, evict the oldest connection
            if connections.len() >= self.max_connections {
                if let Some(oldest) = connections
                    .iter()
                    .min_by_key(|(_, p)| p.last_used)
                    .map(|(id, _)| *id)
                {
                    debug!(node = %oldest, "Evicting oldest connection (pool full)");
                    connections.remove(&oldest);
                }
            }

            connections.insert(
                endpoint.id,
                PooledConnection {
                    conn: conn.clone(),
                    last_used: Instant::now(),
                },
            );
        }

        info!(node = %endpoint.id, "Connected to storage node");
        Ok(conn)
    }

    /// Drop the cached connection to a node
    pub async fn invalidate(&self, node_id: &NodeId) {
        if self.connections.write().await.remove(node_id).is_some() {
            debug!(node = %node_id, "Dropped pooled connection");
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn contains(&self, node_id: &NodeId) -> bool {
        self.connections.read().await.contains_key(node_id)
    }

    pub async fn clear(&self) {
        self.connections.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;

    fn config(max_connections: usize) -> TransportConfig {
        TransportConfig {
            max_connections,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let network = Arc::new(MemoryNetwork::with_nodes(3));
        let pool = ConnectionPool::new(network.clone(), &config(10));
        let endpoint = network.nodes()[0].endpoint();

        pool.get(&endpoint).await.unwrap();
        pool.get(&endpoint).await.unwrap();

        assert_eq!(network.dial_count(), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_oldest_evicted_when_full() {
        let network = Arc::new(MemoryNetwork::with_nodes(3));
        let pool = ConnectionPool::new(network.clone(), &config(2));
        let nodes = network.nodes();

        pool.get(&nodes[0].endpoint()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get(&nodes[1].endpoint()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get(&nodes[2].endpoint()).await.unwrap();

        assert_eq!(pool.len().await, 2);
        assert!(!pool.contains(&nodes[0].id()).await);
        assert!(pool.contains(&nodes[2].id()).await);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let network = Arc::new(MemoryNetwork::with_nodes(1));
        let pool = ConnectionPool::new(network.clone(), &config(10));
        let endpoint = network.nodes()[0].endpoint();

        pool.get(&endpoint).await.unwrap();
        pool.invalidate(&endpoint.id).await;
        assert!(pool.is_empty().await);

        pool.get(&endpoint).await.unwrap();
        assert_eq!(network.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_node_not_cached() {
        let network = Arc::new(MemoryNetwork::new());
        let node = network.add_node(crate::memory::NodeBehavior::Unreachable);
        let pool = ConnectionPool::new(network.clone(), &config(10));

        assert!(matches!(
            pool.get(&node.endpoint()).await,
            Err(PieceError::Unreachable(_))
        ));
        assert!(pool.is_empty().await);
    }
}
