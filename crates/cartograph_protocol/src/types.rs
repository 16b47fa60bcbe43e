//! Entity and job payload types (canonical definitions).
//!
//! These shapes are shared by the relational store, the queue payloads and
//! the LLM response parsers. Use these everywhere - do not redeclare.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::ids::{CandidateId, PoiId};

// Display via as_str, shared by the canonical enums below.
macro_rules! fmt_as_str {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    };
}

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Processing status of a discovered source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Batched,
    Analyzed,
    Failed,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Batched => "batched",
            FileStatus::Analyzed => "analyzed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fmt_as_str!();
}

impl FromStr for FileStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "batched" => Ok(FileStatus::Batched),
            "analyzed" => Ok(FileStatus::Analyzed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(ProtocolError::UnknownVariant {
                kind: "file status",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of a point of interest extracted from a file.
///
/// The LLM is free to return kinds we do not enumerate; those deserialize
/// to `Other` rather than invalidating the whole response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoiType {
    Function,
    Class,
    Method,
    Variable,
    Import,
    Table,
    Constant,
    #[serde(other)]
    Other,
}

impl PoiType {
    pub fn as_str(self) -> &'static str {
        match self {
            PoiType::Function => "function",
            PoiType::Class => "class",
            PoiType::Method => "method",
            PoiType::Variable => "variable",
            PoiType::Import => "import",
            PoiType::Table => "table",
            PoiType::Constant => "constant",
            PoiType::Other => "other",
        }
    }
}

impl fmt::Display for PoiType {
    fmt_as_str!();
}

impl FromStr for PoiType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "function" => PoiType::Function,
            "class" => PoiType::Class,
            "method" => PoiType::Method,
            "variable" => PoiType::Variable,
            "import" => PoiType::Import,
            "table" => PoiType::Table,
            "constant" => PoiType::Constant,
            _ => PoiType::Other,
        })
    }
}

/// Typed relationship between two POIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    Calls,
    Uses,
    Imports,
    Extends,
    Contains,
    Implements,
    References,
    #[serde(other)]
    Other,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipType::Calls => "CALLS",
            RelationshipType::Uses => "USES",
            RelationshipType::Imports => "IMPORTS",
            RelationshipType::Extends => "EXTENDS",
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Other => "OTHER",
        }
    }
}

impl fmt::Display for RelationshipType {
    fmt_as_str!();
}

impl FromStr for RelationshipType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CALLS" => RelationshipType::Calls,
            "USES" => RelationshipType::Uses,
            "IMPORTS" => RelationshipType::Imports,
            "EXTENDS" => RelationshipType::Extends,
            "CONTAINS" => RelationshipType::Contains,
            "IMPLEMENTS" => RelationshipType::Implements,
            "REFERENCES" => RelationshipType::References,
            _ => RelationshipType::Other,
        })
    }
}

/// Lifecycle status of a relationship candidate.
///
/// `Deferred` is a terminal state produced only by triangulation consensus
/// (never by the scorer): candidates that could not be decided land there
/// for human review rather than being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Scored,
    Escalated,
    Accepted,
    Rejected,
    Deferred,
}

impl CandidateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Scored => "scored",
            CandidateStatus::Escalated => "escalated",
            CandidateStatus::Accepted => "accepted",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Deferred => "deferred",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CandidateStatus::Accepted | CandidateStatus::Rejected | CandidateStatus::Deferred
        )
    }
}

impl fmt::Display for CandidateStatus {
    fmt_as_str!();
}

impl FromStr for CandidateStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CandidateStatus::Pending),
            "scored" => Ok(CandidateStatus::Scored),
            "escalated" => Ok(CandidateStatus::Escalated),
            "accepted" => Ok(CandidateStatus::Accepted),
            "rejected" => Ok(CandidateStatus::Rejected),
            "deferred" => Ok(CandidateStatus::Deferred),
            other => Err(ProtocolError::UnknownVariant {
                kind: "candidate status",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of a single piece of evidence attached to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceKind {
    LlmReasoning,
    SyntaxPattern,
    SemanticDomain,
    ArchitecturalPattern,
    CrossReference,
    DynamicPattern,
    ApiIntegration,
    DomainConsistency,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::LlmReasoning => "LLM_REASONING",
            EvidenceKind::SyntaxPattern => "SYNTAX_PATTERN",
            EvidenceKind::SemanticDomain => "SEMANTIC_DOMAIN",
            EvidenceKind::ArchitecturalPattern => "ARCHITECTURAL_PATTERN",
            EvidenceKind::CrossReference => "CROSS_REFERENCE",
            EvidenceKind::DynamicPattern => "DYNAMIC_PATTERN",
            EvidenceKind::ApiIntegration => "API_INTEGRATION",
            EvidenceKind::DomainConsistency => "DOMAIN_CONSISTENCY",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fmt_as_str!();
}

impl FromStr for EvidenceKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LLM_REASONING" => Ok(EvidenceKind::LlmReasoning),
            "SYNTAX_PATTERN" => Ok(EvidenceKind::SyntaxPattern),
            "SEMANTIC_DOMAIN" => Ok(EvidenceKind::SemanticDomain),
            "ARCHITECTURAL_PATTERN" => Ok(EvidenceKind::ArchitecturalPattern),
            "CROSS_REFERENCE" => Ok(EvidenceKind::CrossReference),
            "DYNAMIC_PATTERN" => Ok(EvidenceKind::DynamicPattern),
            "API_INTEGRATION" => Ok(EvidenceKind::ApiIntegration),
            "DOMAIN_CONSISTENCY" => Ok(EvidenceKind::DomainConsistency),
            other => Err(ProtocolError::UnknownVariant {
                kind: "evidence kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Confidence band derived from the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    /// Band thresholds: >= 0.85 HIGH, >= 0.65 MEDIUM, >= 0.45 LOW.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            ConfidenceLevel::High
        } else if score >= 0.65 {
            ConfidenceLevel::Medium
        } else if score >= 0.45 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::Low => "LOW",
            ConfidenceLevel::VeryLow => "VERY_LOW",
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fmt_as_str!();
}

// ============================================================================
// Entities
// ============================================================================

/// A source file discovered under the target directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub status: FileStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// A point of interest extracted from a file.
///
/// The id is a stable hash of (file_path, name, type, line span), so
/// re-analyzing an unchanged file produces identical ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub id: PoiId,
    pub file_path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub poi_type: PoiType,
    pub start_line: u32,
    pub end_line: u32,
    /// Raw LLM excerpt, when the model returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// A proposed edge between two POIs, prior to a confidence decision.
///
/// The target may be unresolved at creation time: the LLM names a symbol,
/// and resolution to a concrete POI id happens when (and if) the symbol is
/// found. Unresolved candidates keep the symbolic name plus a hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub id: CandidateId,
    pub source_poi_id: PoiId,
    pub target_poi_id: Option<PoiId>,
    pub target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_hint: Option<String>,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    pub file_path: String,
    pub reason: String,
    pub confidence: f64,
    pub status: CandidateStatus,
}

/// A single justification for (or against) a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Database-assigned id; 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub candidate_id: CandidateId,
    pub kind: EvidenceKind,
    pub text: String,
    /// Name of the agent that produced this evidence ("llm", or a
    /// triangulation sub-agent kind).
    pub agent: String,
    pub confidence: f64,
    /// Structured context flags, e.g. {"dynamic_import": true}.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl EvidenceItem {
    /// True when a context flag is present and truthy.
    pub fn context_flag(&self, key: &str) -> bool {
        self.context
            .get(key)
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false)
    }
}

/// Per-factor scores feeding the weighted confidence sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub syntax: f64,
    pub semantic: f64,
    pub context: f64,
    pub cross_ref: f64,
}

/// Full confidence computation trace, embedded in the candidate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub factors: FactorScores,
    pub weighted_sum: f64,
    pub penalty_factor: f64,
    pub uncertainty_adjustment: f64,
    pub raw_score: f64,
    pub final_confidence: f64,
    pub level: ConfidenceLevel,
    pub escalation_needed: bool,
    /// Which escalation triggers fired, by name.
    #[serde(default)]
    pub fired_triggers: Vec<String>,
}

// ============================================================================
// Triangulation
// ============================================================================

/// The fixed sub-agent roster. New analysts are added here and in the
/// dispatch table, not by subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    SyntaxAnalyst,
    SemanticAnalyst,
    ContextualAnalyst,
    CrossRefAnalyst,
    ArchitecturalAnalyst,
    DynamicAnalyst,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::SyntaxAnalyst,
        AgentKind::SemanticAnalyst,
        AgentKind::ContextualAnalyst,
        AgentKind::CrossRefAnalyst,
        AgentKind::ArchitecturalAnalyst,
        AgentKind::DynamicAnalyst,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::SyntaxAnalyst => "syntax_analyst",
            AgentKind::SemanticAnalyst => "semantic_analyst",
            AgentKind::ContextualAnalyst => "contextual_analyst",
            AgentKind::CrossRefAnalyst => "cross_ref_analyst",
            AgentKind::ArchitecturalAnalyst => "architectural_analyst",
            AgentKind::DynamicAnalyst => "dynamic_analyst",
        }
    }

    /// Evidence kinds this analyst re-scores from. Subsets are disjoint so
    /// agent opinions stay independent.
    pub fn evidence_kinds(self) -> &'static [EvidenceKind] {
        match self {
            AgentKind::SyntaxAnalyst => &[EvidenceKind::SyntaxPattern],
            AgentKind::SemanticAnalyst => {
                &[EvidenceKind::SemanticDomain, EvidenceKind::DomainConsistency]
            }
            AgentKind::ContextualAnalyst => &[EvidenceKind::LlmReasoning],
            AgentKind::CrossRefAnalyst => &[EvidenceKind::CrossReference],
            AgentKind::ArchitecturalAnalyst => {
                &[EvidenceKind::ArchitecturalPattern, EvidenceKind::ApiIntegration]
            }
            AgentKind::DynamicAnalyst => &[EvidenceKind::DynamicPattern],
        }
    }
}

impl fmt::Display for AgentKind {
    fmt_as_str!();
}

/// What a single sub-agent returned for an escalated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub kind: AgentKind,
    pub score: f64,
    pub veto: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Consensus decision for an escalated candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusOutcome {
    Accepted,
    Rejected,
    Deferred,
}

impl ConsensusOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsensusOutcome::Accepted => "accepted",
            ConsensusOutcome::Rejected => "rejected",
            ConsensusOutcome::Deferred => "deferred",
        }
    }
}

impl fmt::Display for ConsensusOutcome {
    fmt_as_str!();
}

/// Triangulation session state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Queued,
    Dispatched,
    AwaitingAgents,
    Consensus,
    Completed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Queued => "queued",
            SessionPhase::Dispatched => "dispatched",
            SessionPhase::AwaitingAgents => "awaiting-agents",
            SessionPhase::Consensus => "consensus",
            SessionPhase::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fmt_as_str!();
}

/// One triangulation run over one escalated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationSession {
    pub id: String,
    pub candidate_id: CandidateId,
    pub started_at: DateTime<Utc>,
    pub phase: SessionPhase,
    /// Per-agent results, filled as agents report in.
    #[serde(default)]
    pub agent_results: Vec<AgentResult>,
    #[serde(default)]
    pub outcome: Option<ConsensusOutcome>,
    #[serde(default)]
    pub final_confidence: Option<f64>,
}

// ============================================================================
// Outbox
// ============================================================================

/// Event types appended to the outbox. Wire names are the kebab-case
/// strings the rest of the system routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutboxEventType {
    BatchReady,
    PoiCreated,
    RelationshipsRequested,
    CandidateReadyForScoring,
    CandidateEscalated,
    CandidateAccepted,
    FileFailed,
}

impl OutboxEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxEventType::BatchReady => "batch-ready",
            OutboxEventType::PoiCreated => "poi-created",
            OutboxEventType::RelationshipsRequested => "relationships-requested",
            OutboxEventType::CandidateReadyForScoring => "candidate-ready-for-scoring",
            OutboxEventType::CandidateEscalated => "candidate-escalated",
            OutboxEventType::CandidateAccepted => "candidate-accepted",
            OutboxEventType::FileFailed => "file-failed",
        }
    }

    /// Queue this event type is drained into, if any. Purely informational
    /// events (`poi-created`, `file-failed`) have no queue: they are
    /// dispatched by marking alone and exist for audit and monitoring.
    pub fn target_queue(self) -> Option<&'static str> {
        match self {
            OutboxEventType::BatchReady => Some(crate::queues::FILE_ANALYSIS),
            OutboxEventType::RelationshipsRequested => {
                Some(crate::queues::RELATIONSHIP_RESOLUTION)
            }
            OutboxEventType::CandidateReadyForScoring => Some(crate::queues::CANDIDATE_SCORING),
            OutboxEventType::CandidateEscalated => Some(crate::queues::TRIANGULATION),
            OutboxEventType::CandidateAccepted => Some(crate::queues::GRAPH_MERGE),
            OutboxEventType::PoiCreated | OutboxEventType::FileFailed => None,
        }
    }
}

impl fmt::Display for OutboxEventType {
    fmt_as_str!();
}

impl FromStr for OutboxEventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch-ready" => Ok(OutboxEventType::BatchReady),
            "poi-created" => Ok(OutboxEventType::PoiCreated),
            "relationships-requested" => Ok(OutboxEventType::RelationshipsRequested),
            "candidate-ready-for-scoring" => Ok(OutboxEventType::CandidateReadyForScoring),
            "candidate-escalated" => Ok(OutboxEventType::CandidateEscalated),
            "candidate-accepted" => Ok(OutboxEventType::CandidateAccepted),
            "file-failed" => Ok(OutboxEventType::FileFailed),
            other => Err(ProtocolError::UnknownVariant {
                kind: "outbox event type",
                value: other.to_string(),
            }),
        }
    }
}

/// Outbox row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    New,
    Dispatched,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::New => "new",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// One append-only outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: OutboxEventType,
    /// Aggregate this event belongs to (file path or candidate id); events
    /// for one aggregate are published in id order.
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
}

// ============================================================================
// Queue
// ============================================================================

/// Job lifecycle state within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl FromStr for JobState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(ProtocolError::UnknownVariant {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

/// A reserved queue job handed to a worker.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: i64,
    pub queue: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub priority: i32,
    pub state: JobState,
    pub last_error: Option<String>,
}

impl QueueJob {
    /// Deserialize the payload into a concrete job type.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::Payload {
            queue: self.queue.clone(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Job payloads
// ============================================================================

/// One file's slot inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub file_name: String,
    pub path: String,
    pub chars: usize,
    /// Character offset of this file's section within the batch prompt.
    pub offset: usize,
}

/// An ordered group of files analyzed in one LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBatch {
    pub files: Vec<BatchEntry>,
    pub total_chars: usize,
    pub is_single_large_file: bool,
}

/// Payload for `file-analysis` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub batch: FileBatch,
}

/// Payload for `relationship-resolution` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRequestJob {
    pub file_path: String,
}

/// Payload for `candidate-scoring` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringJob {
    pub candidate_id: CandidateId,
}

/// Payload for `triangulation` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangulationJob {
    pub candidate_id: CandidateId,
    pub session_id: String,
}

/// Payload for `graph-merge` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMergeJob {
    pub candidate_id: CandidateId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_level_bands() {
        assert_eq!(ConfidenceLevel::from_score(0.9), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.85), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.7), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.5), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(0.1), ConfidenceLevel::VeryLow);
    }

    #[test]
    fn test_evidence_kind_roundtrip() {
        for kind in [
            EvidenceKind::LlmReasoning,
            EvidenceKind::SyntaxPattern,
            EvidenceKind::SemanticDomain,
            EvidenceKind::ArchitecturalPattern,
            EvidenceKind::CrossReference,
            EvidenceKind::DynamicPattern,
            EvidenceKind::ApiIntegration,
            EvidenceKind::DomainConsistency,
        ] {
            assert_eq!(kind.as_str().parse::<EvidenceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_poi_type_unknown_falls_back_to_other() {
        let ty: PoiType = serde_json::from_str("\"decorator\"").unwrap();
        assert_eq!(ty, PoiType::Other);
    }

    #[test]
    fn test_event_type_queue_mapping() {
        assert_eq!(
            OutboxEventType::BatchReady.target_queue(),
            Some(crate::queues::FILE_ANALYSIS)
        );
        assert_eq!(OutboxEventType::PoiCreated.target_queue(), None);
        assert_eq!(
            OutboxEventType::CandidateAccepted.target_queue(),
            Some(crate::queues::GRAPH_MERGE)
        );
    }

    #[test]
    fn test_agent_evidence_subsets_disjoint() {
        let mut seen = std::collections::HashSet::new();
        for agent in AgentKind::ALL {
            for kind in agent.evidence_kinds() {
                assert!(seen.insert(*kind), "{kind} assigned to two agents");
            }
        }
    }

    #[test]
    fn test_queue_job_payload_parse() {
        let job = QueueJob {
            id: 1,
            queue: crate::queues::RELATIONSHIP_RESOLUTION.to_string(),
            payload: serde_json::json!({"file_path": "src/main.rs"}),
            attempts: 0,
            max_attempts: 3,
            priority: 0,
            state: JobState::Active,
            last_error: None,
        };
        let parsed: RelationshipRequestJob = job.parse().unwrap();
        assert_eq!(parsed.file_path, "src/main.rs");
    }
}
