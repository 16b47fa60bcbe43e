//! SQLite-backed graph store.
//!
//! Reference implementation of the MERGE contract; production deployments
//! point the trait at an external graph database instead.

use async_trait::async_trait;
use tracing::debug;

use crate::{GraphEdge, GraphError, GraphNode, GraphStore};

pub struct SqliteGraphStore {
    pool: sqlx::SqlitePool,
}

impl SqliteGraphStore {
    pub async fn new(pool: sqlx::SqlitePool) -> Result<Self, GraphError> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), GraphError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS graph_nodes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                file_path TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS graph_edges (
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                provenance TEXT NOT NULL,
                PRIMARY KEY (source_id, target_id, rel_type)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn merge_nodes(&self, nodes: &[GraphNode]) -> Result<(), GraphError> {
        let mut tx = self.pool.begin().await?;
        for node in nodes {
            // Monotonic attribute update: blanks fill in, nothing downgrades
            sqlx::query(
                r#"
                INSERT INTO graph_nodes (id, name, kind, file_path)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = CASE WHEN graph_nodes.name = '' THEN excluded.name ELSE graph_nodes.name END,
                    kind = CASE WHEN graph_nodes.kind = '' THEN excluded.kind ELSE graph_nodes.kind END,
                    file_path = CASE WHEN graph_nodes.file_path = '' THEN excluded.file_path ELSE graph_nodes.file_path END
                "#,
            )
            .bind(&node.id)
            .bind(&node.name)
            .bind(&node.kind)
            .bind(&node.file_path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(nodes = nodes.len(), "Merged graph nodes");
        Ok(())
    }

    async fn merge_edges(&self, edges: &[GraphEdge]) -> Result<(), GraphError> {
        let mut tx = self.pool.begin().await?;
        for edge in edges {
            sqlx::query(
                r#"
                INSERT INTO graph_edges (source_id, target_id, rel_type, confidence, provenance)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source_id, target_id, rel_type) DO UPDATE SET
                    confidence = MAX(graph_edges.confidence, excluded.confidence)
                "#,
            )
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(&edge.rel_type)
            .bind(edge.confidence)
            .bind(&edge.provenance)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(edges = edges.len(), "Merged graph edges");
        Ok(())
    }

    async fn node_count(&self) -> Result<i64, GraphError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM graph_nodes")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn edge_count(&self) -> Result<i64, GraphError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM graph_edges")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteGraphStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteGraphStore::new(pool).await.unwrap()
    }

    fn node(id: &str) -> GraphNode {
        GraphNode {
            id: id.to_string(),
            name: format!("name-{id}"),
            kind: "function".to_string(),
            file_path: "src/lib.rs".to_string(),
        }
    }

    fn edge(source: &str, target: &str) -> GraphEdge {
        GraphEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
            rel_type: "CALLS".to_string(),
            confidence: 0.8,
            provenance: "cand-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let store = store().await;
        let nodes = [node("a"), node("b")];
        let edges = [edge("a", "b")];

        for _ in 0..2 {
            store.merge_nodes(&nodes).await.unwrap();
            store.merge_edges(&edges).await.unwrap();
        }

        assert_eq!(store.node_count().await.unwrap(), 2);
        assert_eq!(store.edge_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edge_confidence_never_downgrades() {
        let store = store().await;
        store.merge_nodes(&[node("a"), node("b")]).await.unwrap();

        let mut e = edge("a", "b");
        e.confidence = 0.9;
        store.merge_edges(std::slice::from_ref(&e)).await.unwrap();
        e.confidence = 0.4;
        store.merge_edges(std::slice::from_ref(&e)).await.unwrap();

        let stored: f64 = sqlx::query_scalar(
            "SELECT confidence FROM graph_edges WHERE source_id = 'a' AND target_id = 'b'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(stored, 0.9);
    }
}
