//! The Cartograph cognitive-triangulation pipeline.
//!
//! A multi-stage, queue-driven worker system: files are batched and sent
//! to the LLM for POI extraction, relationships between POIs are resolved
//! and scored, low-confidence candidates are triangulated by independent
//! sub-agents, and accepted relationships are merged idempotently into the
//! graph store. Every cross-stage hop is a queue job; every persisted side
//! effect rides the transactional outbox.

pub mod analysis;
pub mod batcher;
pub mod error;
pub mod graph_builder;
pub mod monitor;
pub mod pool;
pub mod publisher;
pub mod resolution;
pub mod runner;
pub mod scanner;
pub mod scoring;
pub mod shutdown;
pub mod triangulation;

pub use batcher::FileBatcher;
pub use error::PipelineError;
pub use monitor::{PipelineMonitor, PipelineSnapshot};
pub use pool::{JobHandler, PoolPolicy, PoolStatus, WorkerPoolManager};
pub use publisher::OutboxPublisher;
pub use runner::{PipelineRunner, RunOutcome, RunReport};
pub use scanner::{ScanStats, Scanner};
pub use scoring::{score_candidate, ScoringWorker};
pub use shutdown::{ShutdownBucket, ShutdownCoordinator, ShutdownEvent, ShutdownState};
pub use triangulation::TriangulationWorker;
