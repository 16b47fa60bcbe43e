//! Read-only pipeline progress and health projection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cartograph_db::{CartographDb, QueueStats};
use cartograph_db::store::StoreCounts;
use cartograph_graph::GraphStore;
use cartograph_protocol::queues;

use crate::error::Result;

/// Point-in-time snapshot of everything the dashboards (and the e2e test
/// gate) care about.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub store: StoreCounts,
    pub queues: HashMap<String, QueueStats>,
    pub outbox_new: i64,
    pub outbox_dispatched: i64,
    pub outbox_failed: i64,
    pub graph_nodes: i64,
    pub graph_edges: i64,
    /// Completed jobs per second since the monitor was created.
    pub processing_rate: f64,
}

impl PipelineSnapshot {
    /// No undispatched events and no open jobs anywhere: the pipeline has
    /// nothing left to do.
    pub fn is_quiescent(&self) -> bool {
        self.outbox_new == 0 && self.queues.values().all(|s| s.open() == 0)
    }

    /// Candidates still moving through scoring or triangulation.
    pub fn undecided_candidates(&self) -> i64 {
        self.store.candidates_pending + self.store.candidates_scored + self.store.candidates_escalated
    }
}

pub struct PipelineMonitor {
    db: CartographDb,
    graph: Arc<dyn GraphStore>,
    started: Instant,
}

impl PipelineMonitor {
    pub fn new(db: CartographDb, graph: Arc<dyn GraphStore>) -> Self {
        Self {
            db,
            graph,
            started: Instant::now(),
        }
    }

    pub async fn snapshot(&self) -> Result<PipelineSnapshot> {
        let store = self.db.store().counts().await?;
        let queue = self.db.queue();

        let mut stats = HashMap::new();
        let mut completed_total = 0i64;
        for name in queues::ALL {
            let s = queue.stats(name).await?;
            completed_total += s.completed;
            stats.insert(name.to_string(), s);
        }

        let (outbox_new, outbox_dispatched, outbox_failed) = self.db.outbox().counts().await?;
        let graph_nodes = self.graph.node_count().await?;
        let graph_edges = self.graph.edge_count().await?;

        let elapsed = self.started.elapsed().as_secs_f64();
        let processing_rate = if elapsed > 0.0 {
            completed_total as f64 / elapsed
        } else {
            0.0
        };

        Ok(PipelineSnapshot {
            store,
            queues: stats,
            outbox_new,
            outbox_dispatched,
            outbox_failed,
            graph_nodes,
            graph_edges,
            processing_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::EnqueueOpts;
    use cartograph_graph::MemoryGraphStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_pipeline_is_quiescent() {
        let db = CartographDb::connect_memory().await.unwrap();
        let monitor = PipelineMonitor::new(db, Arc::new(MemoryGraphStore::new()));
        let snapshot = monitor.snapshot().await.unwrap();
        assert!(snapshot.is_quiescent());
        assert_eq!(snapshot.graph_nodes, 0);
    }

    #[tokio::test]
    async fn test_open_job_blocks_quiescence() {
        let db = CartographDb::connect_memory().await.unwrap();
        db.queue()
            .enqueue(queues::FILE_ANALYSIS, &json!({}), EnqueueOpts::default())
            .await
            .unwrap();

        let monitor = PipelineMonitor::new(db, Arc::new(MemoryGraphStore::new()));
        let snapshot = monitor.snapshot().await.unwrap();
        assert!(!snapshot.is_quiescent());
    }
}
