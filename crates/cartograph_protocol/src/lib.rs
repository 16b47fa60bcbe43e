//! Canonical types for the Cartograph pipeline.
//!
//! Every cross-stage hop in the pipeline is a queue job and every persisted
//! side effect goes through the outbox; the payloads for both live here so
//! that all crates agree on one wire shape.

pub mod config;
pub mod error;
pub mod ids;
pub mod types;

// Re-export types for convenience
pub use types::{
    // Entities
    AgentKind,
    AgentResult,
    BatchEntry,
    CandidateStatus,
    ConfidenceBreakdown,
    ConfidenceLevel,
    ConsensusOutcome,
    EvidenceItem,
    EvidenceKind,
    FactorScores,
    FileBatch,
    FileRecord,
    FileStatus,
    OutboxEvent,
    OutboxEventType,
    OutboxStatus,
    Poi,
    PoiType,
    RelationshipCandidate,
    RelationshipType,
    SessionPhase,
    TriangulationSession,
    // Queue types
    JobState,
    QueueJob,
    // Job payloads
    BatchJob,
    GraphMergeJob,
    RelationshipRequestJob,
    ScoringJob,
    TriangulationJob,
};

pub use config::{
    defaults, BatchPolicy, ConsensusConfig, EscalationTrigger, LlmSettings, PenaltyWeights,
    PipelineConfig, PoolLimits, ScorerConfig, ScorerWeights,
};

pub use error::{ErrorClass, ProtocolError};

pub use ids::{candidate_id, content_hash, poi_id, CandidateId, PoiId};

/// Queue names, one per cross-stage hop.
pub mod queues {
    /// File/batch jobs consumed by the file analysis workers.
    pub const FILE_ANALYSIS: &str = "file-analysis";
    /// Per-file relationship requests consumed by the resolution workers.
    pub const RELATIONSHIP_RESOLUTION: &str = "relationship-resolution";
    /// Candidates awaiting a confidence decision.
    pub const CANDIDATE_SCORING: &str = "candidate-scoring";
    /// Escalated candidates awaiting triangulation.
    pub const TRIANGULATION: &str = "triangulation";
    /// Accepted candidates awaiting the graph merge.
    pub const GRAPH_MERGE: &str = "graph-merge";

    /// All queues, in pipeline order.
    pub const ALL: [&str; 5] = [
        FILE_ANALYSIS,
        RELATIONSHIP_RESOLUTION,
        CANDIDATE_SCORING,
        TRIANGULATION,
        GRAPH_MERGE,
    ];
}
