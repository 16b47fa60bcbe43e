//! Graph builder.
//!
//! Drains accepted candidates into the graph store. MERGE semantics make
//! redelivery harmless; a failed merge nacks the job so the queue retries
//! it with backoff.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use cartograph_db::PipelineStore;
use cartograph_graph::{GraphEdge, GraphNode, GraphStore};
use cartograph_protocol::{poi_id, CandidateStatus, GraphMergeJob, Poi, QueueJob};

use crate::error::Result;
use crate::pool::JobHandler;

pub struct GraphBuilderWorker {
    store: PipelineStore,
    graph: Arc<dyn GraphStore>,
}

impl GraphBuilderWorker {
    pub fn new(store: PipelineStore, graph: Arc<dyn GraphStore>) -> Self {
        Self { store, graph }
    }

    fn node_for(poi: &Poi) -> GraphNode {
        GraphNode {
            id: poi.id.as_str().to_string(),
            name: poi.name.clone(),
            kind: poi.poi_type.as_str().to_string(),
            file_path: poi.file_path.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for GraphBuilderWorker {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let GraphMergeJob { candidate_id } = job.parse()?;

        let Some(candidate) = self.store.candidate(&candidate_id).await? else {
            warn!(candidate_id = %candidate_id, "Candidate vanished, dropping job");
            return Ok(());
        };
        if candidate.status != CandidateStatus::Accepted {
            // Redelivered or superseded; merging would break invariant 4
            return Ok(());
        }

        let Some(source) = self.store.poi(&candidate.source_poi_id).await? else {
            warn!(candidate_id = %candidate_id, "Source POI missing, dropping job");
            return Ok(());
        };

        // Resolve the target late if scoring accepted an unresolved symbol
        let target_node = match &candidate.target_poi_id {
            Some(id) => self.store.poi(id).await?.map(|poi| Self::node_for(&poi)),
            None => self
                .store
                .resolve_poi(&candidate.target_name, &candidate.file_path)
                .await?
                .map(|poi| Self::node_for(&poi)),
        };
        let target_node = target_node.unwrap_or_else(|| {
            // External entity the scan never saw; still a stable node
            let id = poi_id(&candidate.file_path, &candidate.target_name, "external", 0, 0);
            GraphNode {
                id: id.as_str().to_string(),
                name: candidate.target_name.clone(),
                kind: "external".to_string(),
                file_path: String::new(),
            }
        });

        let source_node = Self::node_for(&source);
        let edge = GraphEdge {
            source_id: source_node.id.clone(),
            target_id: target_node.id.clone(),
            rel_type: candidate.rel_type.as_str().to_string(),
            confidence: candidate.confidence,
            provenance: candidate.id.as_str().to_string(),
        };

        self.graph.merge_nodes(&[source_node, target_node]).await?;
        self.graph.merge_edges(&[edge]).await?;

        debug!(candidate_id = %candidate.id, "Merged into graph");
        Ok(())
    }
}
