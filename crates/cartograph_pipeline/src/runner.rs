//! Pipeline runner.
//!
//! Assembles the whole pipeline for one target directory and drives it to
//! quiescence: scan, batch, start the pools and the outbox publisher,
//! watch the monitor until nothing is left in flight, then shut everything
//! down through the coordinator. The report maps to the driver's exit
//! codes (0 success, 1 partial, 2 failure).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

use cartograph_db::CartographDb;
use cartograph_graph::GraphStore;
use cartograph_llm::LlmClient;
use cartograph_protocol::{queues, FileStatus, PipelineConfig};

use crate::analysis::FileAnalysisWorker;
use crate::batcher::FileBatcher;
use crate::error::Result;
use crate::graph_builder::GraphBuilderWorker;
use crate::monitor::{PipelineMonitor, PipelineSnapshot};
use crate::pool::{PoolPolicy, WorkerPoolManager};
use crate::publisher::OutboxPublisher;
use crate::resolution::RelationshipResolutionWorker;
use crate::scanner::{ScanStats, Scanner};
use crate::scoring::ScoringWorker;
use crate::shutdown::{ShutdownBucket, ShutdownConfig, ShutdownCoordinator, ShutdownReport};
use crate::triangulation::TriangulationWorker;

/// Overall run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug)]
pub struct RunReport {
    pub scan: ScanStats,
    pub snapshot: PipelineSnapshot,
    pub shutdown: ShutdownReport,
    pub outcome: RunOutcome,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 1,
            RunOutcome::Failure => 2,
        }
    }
}

pub struct PipelineRunner {
    config: PipelineConfig,
    db: CartographDb,
    llm: Arc<dyn LlmClient>,
    graph: Arc<dyn GraphStore>,
    /// Abort the run when no progress happens for this long.
    stall_timeout: Duration,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        db: CartographDb,
        llm: Arc<dyn LlmClient>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            config,
            db,
            llm,
            graph,
            stall_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub async fn run(&self, target: &Path) -> Result<RunReport> {
        let started = Instant::now();
        let store = self.db.store();

        // Scan and batch
        let scanner = Scanner::new(self.db.store());
        let scan = scanner.scan(target).await?;

        let pending = store.files_with_status(FileStatus::Pending).await?;
        let batcher = FileBatcher::new(self.config.batching.clone());
        let sizes: Vec<(String, u64)> = pending
            .iter()
            .map(|f| (f.path.clone(), f.size_bytes as u64))
            .collect();
        let batches = batcher.plan(&sizes);
        store.record_batches(&batches).await?;
        info!(
            files = pending.len(),
            batches = batches.len(),
            "Work planned"
        );

        // Worker pools
        let manager = Arc::new(WorkerPoolManager::new(self.db.queue(), self.config.pools));
        manager.register(
            queues::FILE_ANALYSIS,
            Arc::new(FileAnalysisWorker::new(
                self.db.store(),
                Arc::clone(&self.llm),
                FileBatcher::new(self.config.batching.clone()),
            )),
            PoolPolicy::default().with_max_workers(self.config.pools.max_file_analysis_workers),
        );
        manager.register(
            queues::RELATIONSHIP_RESOLUTION,
            Arc::new(RelationshipResolutionWorker::new(
                self.db.store(),
                Arc::clone(&self.llm),
            )),
            PoolPolicy::default().with_max_workers(self.config.pools.max_relationship_workers),
        );
        manager.register(
            queues::CANDIDATE_SCORING,
            Arc::new(ScoringWorker::new(
                self.db.store(),
                self.config.scorer.clone(),
            )),
            PoolPolicy::default().with_max_workers(2),
        );
        manager.register(
            queues::TRIANGULATION,
            Arc::new(TriangulationWorker::new(
                self.db.store(),
                self.config.consensus.clone(),
            )),
            PoolPolicy::default().with_max_workers(2),
        );
        manager.register(
            queues::GRAPH_MERGE,
            Arc::new(GraphBuilderWorker::new(
                self.db.store(),
                Arc::clone(&self.graph),
            )),
            PoolPolicy::default().with_max_workers(2),
        );
        Arc::clone(&manager).start();

        // Outbox publisher
        let (publisher_stop, publisher_stop_rx) = watch::channel(false);
        let publisher = OutboxPublisher::new(self.db.clone());
        let publisher_handle = Arc::new(tokio::sync::Mutex::new(Some(tokio::spawn(
            async move { publisher.run(publisher_stop_rx).await },
        ))));

        // Watch for quiescence
        let monitor = PipelineMonitor::new(self.db.clone(), Arc::clone(&self.graph));
        let mut stalled = false;
        let mut last_progress = Instant::now();
        let mut last_fingerprint = (0i64, 0i64);
        let mut quiet_polls = 0u32;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let snapshot = monitor.snapshot().await?;

            let completed: i64 = snapshot.queues.values().map(|s| s.completed).sum();
            let fingerprint = (completed, snapshot.outbox_dispatched);
            if fingerprint != last_fingerprint {
                last_fingerprint = fingerprint;
                last_progress = Instant::now();
            }

            if snapshot.is_quiescent() {
                // One extra poll: an ack can race the outbox append of the
                // next stage
                quiet_polls += 1;
                if quiet_polls >= 2 {
                    break;
                }
            } else {
                quiet_polls = 0;
            }

            if last_progress.elapsed() > self.stall_timeout {
                warn!("Pipeline stalled, aborting run");
                stalled = true;
                break;
            }
        }

        // Coordinated shutdown
        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
        {
            let manager = Arc::clone(&manager);
            coordinator.register("worker-pools", ShutdownBucket::Workers, 10, move |t| {
                let manager = Arc::clone(&manager);
                async move { manager.shutdown(t).await.map_err(|e| e.to_string()) }
            });
        }
        {
            let handle = Arc::clone(&publisher_handle);
            coordinator.register("outbox-publisher", ShutdownBucket::Managers, 10, move |t| {
                let _ = publisher_stop.send(true);
                let handle = Arc::clone(&handle);
                async move {
                    let Some(join) = handle.lock().await.take() else {
                        return Ok(());
                    };
                    match tokio::time::timeout(t, join).await {
                        Ok(Ok(Ok(_))) => Ok(()),
                        Ok(Ok(Err(e))) => Err(e.to_string()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("publisher did not stop in time".to_string()),
                    }
                }
            });
        }
        {
            let db = self.db.clone();
            coordinator.register("database", ShutdownBucket::Connections, 10, move |_t| {
                let db = db.clone();
                async move {
                    db.pool().close().await;
                    Ok(())
                }
            });
        }
        coordinator.register("log-flush", ShutdownBucket::Cleanup, 0, |_t| async {
            // Nothing buffered beyond tracing's own writers
            Ok(())
        });

        // Take the final snapshot before connections close
        let snapshot = monitor.snapshot().await?;
        let shutdown = coordinator.shutdown().await?;

        let outcome = decide_outcome(&scan, &snapshot, stalled);
        let report = RunReport {
            scan,
            snapshot,
            shutdown,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            outcome = ?report.outcome,
            elapsed_ms = report.elapsed_ms,
            "Pipeline run finished"
        );
        Ok(report)
    }
}

fn decide_outcome(scan: &ScanStats, snapshot: &PipelineSnapshot, stalled: bool) -> RunOutcome {
    if scan.files_discovered > 0
        && snapshot.store.files_analyzed == 0
        && snapshot.store.files_total > 0
    {
        return RunOutcome::Failure;
    }

    let queue_losses: i64 = snapshot.queues.values().map(|s| s.failed + s.dead).sum();
    let degraded = stalled
        || snapshot.store.files_failed > 0
        || queue_losses > 0
        || snapshot.outbox_failed > 0
        || snapshot.undecided_candidates() > 0;

    if degraded {
        RunOutcome::Partial
    } else {
        RunOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::QueueStats;
    use cartograph_db::store::StoreCounts;
    use std::collections::HashMap;

    fn snapshot(counts: StoreCounts) -> PipelineSnapshot {
        PipelineSnapshot {
            store: counts,
            queues: HashMap::new(),
            outbox_new: 0,
            outbox_dispatched: 0,
            outbox_failed: 0,
            graph_nodes: 0,
            graph_edges: 0,
            processing_rate: 0.0,
        }
    }

    #[test]
    fn test_outcome_success() {
        let scan = ScanStats {
            files_discovered: 3,
            ..Default::default()
        };
        let snap = snapshot(StoreCounts {
            files_total: 3,
            files_analyzed: 3,
            ..Default::default()
        });
        assert_eq!(decide_outcome(&scan, &snap, false), RunOutcome::Success);
    }

    #[test]
    fn test_outcome_partial_on_failed_files() {
        let scan = ScanStats {
            files_discovered: 3,
            ..Default::default()
        };
        let snap = snapshot(StoreCounts {
            files_total: 3,
            files_analyzed: 2,
            files_failed: 1,
            ..Default::default()
        });
        assert_eq!(decide_outcome(&scan, &snap, false), RunOutcome::Partial);
    }

    #[test]
    fn test_outcome_failure_when_nothing_analyzed() {
        let scan = ScanStats {
            files_discovered: 3,
            ..Default::default()
        };
        let snap = snapshot(StoreCounts {
            files_total: 3,
            ..Default::default()
        });
        assert_eq!(decide_outcome(&scan, &snap, false), RunOutcome::Failure);
    }

    #[test]
    fn test_outcome_partial_on_dead_jobs() {
        let scan = ScanStats {
            files_discovered: 1,
            ..Default::default()
        };
        let mut snap = snapshot(StoreCounts {
            files_total: 1,
            files_analyzed: 1,
            ..Default::default()
        });
        snap.queues.insert(
            "file-analysis".to_string(),
            QueueStats {
                dead: 1,
                ..Default::default()
            },
        );
        assert_eq!(decide_outcome(&scan, &snap, false), RunOutcome::Partial);
    }
}
