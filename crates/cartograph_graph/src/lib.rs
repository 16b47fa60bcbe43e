//! Graph store seam.
//!
//! Nodes are keyed by POI id, edges by (source, target, type). MERGE is
//! idempotent: repeated application of the same accepted candidate leaves
//! the graph unchanged. Attributes only ever improve - blank fields fill
//! in, edge confidence moves up, nothing downgrades.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

use async_trait::async_trait;
use thiserror::Error;

/// A node in the knowledge graph, one per POI.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub file_path: String,
}

/// A typed edge between two POIs.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub confidence: f64,
    /// Candidate id this edge was derived from.
    pub provenance: String,
}

impl GraphEdge {
    /// MERGE key for this edge.
    pub fn key(&self) -> (String, String, String) {
        (
            self.source_id.clone(),
            self.target_id.clone(),
            self.rel_type.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("edge references missing node: {0}")]
    DanglingEdge(String),
}

/// The contract the graph builder writes through.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert nodes. Idempotent; attributes update monotonically.
    async fn merge_nodes(&self, nodes: &[GraphNode]) -> Result<(), GraphError>;

    /// Upsert edges keyed by (source, target, type). Idempotent; the
    /// stored confidence is the max ever seen for the key.
    async fn merge_edges(&self, edges: &[GraphEdge]) -> Result<(), GraphError>;

    async fn node_count(&self) -> Result<i64, GraphError>;

    async fn edge_count(&self) -> Result<i64, GraphError>;
}
