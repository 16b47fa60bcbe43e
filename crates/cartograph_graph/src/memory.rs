//! In-memory graph store for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{GraphEdge, GraphError, GraphNode, GraphStore};

#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: Mutex<HashMap<String, GraphNode>>,
    edges: Mutex<HashMap<(String, String, String), GraphEdge>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(&self, source: &str, target: &str, rel_type: &str) -> Option<GraphEdge> {
        self.edges
            .lock()
            .expect("graph store poisoned")
            .get(&(source.to_string(), target.to_string(), rel_type.to_string()))
            .cloned()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_nodes(&self, nodes: &[GraphNode]) -> Result<(), GraphError> {
        let mut map = self.nodes.lock().expect("graph store poisoned");
        for node in nodes {
            map.entry(node.id.clone())
                .and_modify(|existing| {
                    if existing.name.is_empty() {
                        existing.name = node.name.clone();
                    }
                    if existing.kind.is_empty() {
                        existing.kind = node.kind.clone();
                    }
                    if existing.file_path.is_empty() {
                        existing.file_path = node.file_path.clone();
                    }
                })
                .or_insert_with(|| node.clone());
        }
        Ok(())
    }

    async fn merge_edges(&self, edges: &[GraphEdge]) -> Result<(), GraphError> {
        let mut map = self.edges.lock().expect("graph store poisoned");
        for edge in edges {
            map.entry(edge.key())
                .and_modify(|existing| {
                    existing.confidence = existing.confidence.max(edge.confidence);
                })
                .or_insert_with(|| edge.clone());
        }
        Ok(())
    }

    async fn node_count(&self) -> Result<i64, GraphError> {
        Ok(self.nodes.lock().expect("graph store poisoned").len() as i64)
    }

    async fn edge_count(&self) -> Result<i64, GraphError> {
        Ok(self.edges.lock().expect("graph store poisoned").len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_merge_is_noop() {
        let store = MemoryGraphStore::new();
        let node = GraphNode {
            id: "a".to_string(),
            name: "main".to_string(),
            kind: "function".to_string(),
            file_path: "src/main.rs".to_string(),
        };
        let edge = GraphEdge {
            source_id: "a".to_string(),
            target_id: "b".to_string(),
            rel_type: "CALLS".to_string(),
            confidence: 0.7,
            provenance: "cand".to_string(),
        };

        for _ in 0..3 {
            store.merge_nodes(std::slice::from_ref(&node)).await.unwrap();
            store.merge_edges(std::slice::from_ref(&edge)).await.unwrap();
        }
        assert_eq!(store.node_count().await.unwrap(), 1);
        assert_eq!(store.edge_count().await.unwrap(), 1);
    }
}
