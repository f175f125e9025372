//! Uplink Transport
//!
//! Moves erasure-coded pieces between the uplink and storage nodes:
//! - Node discovery, dialing and the piece protocol as traits
//! - Connection pooling per node
//! - Quorum upload with long-tail cancellation and alternate nodes
//! - First-k download with hash verification
//! - An in-memory node network for tests and development

pub mod error;
pub mod memory;
pub mod node;
pub mod pool;
pub mod transport;

pub use error::{PieceError, PieceResult};
pub use memory::{MemoryNetwork, MemoryNode, NodeBehavior};
pub use node::{Authorization, Dialer, NodeEndpoint, NodeLookup, PieceAck, PieceConnection};
pub use pool::ConnectionPool;
pub use transport::{BudgetReservation, PieceTransport, UploadOutcome, UploadRequest};
