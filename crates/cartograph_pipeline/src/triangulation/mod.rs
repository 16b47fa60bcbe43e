//! Triangulation orchestrator.
//!
//! Escalated candidates get a session that walks `queued -> dispatched ->
//! awaiting-agents -> consensus -> completed`. The orchestrator runs the
//! analyst roster in parallel with a per-agent timeout, combines whatever
//! came back into a weighted consensus, and records the terminal decision.
//! Candidates that cannot reach quorum are deferred, never dropped.

pub mod agents;

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cartograph_db::PipelineStore;
use cartograph_protocol::{
    AgentKind, AgentResult, CandidateStatus, ConsensusConfig, ConsensusOutcome, EvidenceItem,
    QueueJob, SessionPhase, TriangulationJob,
};

use crate::error::Result;
use crate::pool::JobHandler;

/// Combined consensus decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusDecision {
    pub outcome: ConsensusOutcome,
    pub final_confidence: f64,
    pub weighted_mean: f64,
    pub agreement: f64,
    pub vetoes: usize,
}

/// Weighted consensus over the agent results that arrived in time.
///
/// `roster_size` is how many agents were dispatched; missing agents
/// contribute no weight but shave the agreement term. Boundary scores
/// resolve conservatively: exactly on the accept threshold defers,
/// exactly on the reject threshold rejects.
pub fn consensus(
    results: &[AgentResult],
    roster_size: usize,
    config: &ConsensusConfig,
) -> ConsensusDecision {
    let missing = roster_size.saturating_sub(results.len());

    if results.len() < config.min_quorum {
        return ConsensusDecision {
            outcome: ConsensusOutcome::Deferred,
            final_confidence: 0.0,
            weighted_mean: 0.0,
            agreement: 0.0,
            vetoes: results.iter().filter(|r| r.veto).count(),
        };
    }

    let scores: Vec<f64> = results.iter().map(|r| r.score.clamp(0.0, 1.0)).collect();
    let weighted_mean = scores.iter().sum::<f64>() / scores.len() as f64;

    let variance = scores
        .iter()
        .map(|s| (s - weighted_mean).powi(2))
        .sum::<f64>()
        / scores.len() as f64;
    let agreement = (1.0 - variance.sqrt() - 0.05 * missing as f64).clamp(0.0, 1.0);

    let final_confidence = (weighted_mean * agreement).clamp(0.0, 1.0);
    let vetoes = results.iter().filter(|r| r.veto).count();

    let outcome = if vetoes >= 2 || final_confidence <= config.reject_threshold {
        ConsensusOutcome::Rejected
    } else if final_confidence > config.accept_threshold && vetoes == 0 {
        ConsensusOutcome::Accepted
    } else {
        ConsensusOutcome::Deferred
    };

    ConsensusDecision {
        outcome,
        final_confidence,
        weighted_mean,
        agreement,
        vetoes,
    }
}

pub struct TriangulationWorker {
    store: PipelineStore,
    config: ConsensusConfig,
}

impl TriangulationWorker {
    pub fn new(store: PipelineStore, config: ConsensusConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl JobHandler for TriangulationWorker {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let TriangulationJob {
            candidate_id,
            session_id,
        } = job.parse()?;

        let Some(candidate) = self.store.candidate(&candidate_id).await? else {
            warn!(candidate_id = %candidate_id, "Candidate vanished, dropping job");
            return Ok(());
        };
        if candidate.status != CandidateStatus::Escalated {
            // Redelivery after the decision already landed
            return Ok(());
        }
        if self.store.session(&session_id).await?.is_none() {
            warn!(session_id = %session_id, "Session row missing, dropping job");
            return Ok(());
        }

        match self.run_session(&candidate, &session_id).await {
            Ok(()) => Ok(()),
            Err(e) if job.attempts >= job.max_attempts => {
                // Out of attempts: a candidate is deferred for human
                // review, never silently dropped
                warn!(
                    candidate_id = %candidate.id,
                    error = %e,
                    "Triangulation exhausted its attempts, deferring candidate"
                );
                self.store
                    .record_consensus(
                        &session_id,
                        &candidate.id,
                        ConsensusOutcome::Deferred,
                        candidate.confidence,
                        &[],
                    )
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl TriangulationWorker {
    async fn run_session(
        &self,
        candidate: &cartograph_protocol::RelationshipCandidate,
        session_id: &str,
    ) -> Result<()> {
        self.store
            .update_session_phase(session_id, SessionPhase::Dispatched)
            .await?;

        let evidence = self.store.evidence_for(&candidate.id).await?;
        self.store
            .update_session_phase(session_id, SessionPhase::AwaitingAgents)
            .await?;

        // Run the full roster in parallel, each under its own timeout
        let timeout = Duration::from_millis(self.config.agent_timeout_ms);
        let mut set = JoinSet::new();
        for kind in AgentKind::ALL {
            let candidate = candidate.clone();
            let slice = agents::evidence_slice(kind, &evidence);
            set.spawn(async move {
                tokio::time::timeout(timeout, async move {
                    agents::assess(kind, &candidate, &slice)
                })
                .await
            });
        }

        let mut results: Vec<AgentResult> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(_elapsed)) => warn!(session_id, "Agent timed out"),
                Err(e) => warn!(session_id, error = %e, "Agent task failed"),
            }
        }
        // Deterministic consensus input regardless of completion order
        results.sort_by_key(|r| r.kind.as_str());

        self.store
            .update_session_phase(session_id, SessionPhase::Consensus)
            .await?;
        let decision = consensus(&results, AgentKind::ALL.len(), &self.config);
        debug!(
            session_id,
            weighted_mean = decision.weighted_mean,
            agreement = decision.agreement,
            final_confidence = decision.final_confidence,
            vetoes = decision.vetoes,
            "Consensus computed"
        );

        // Each agent's opinion becomes evidence on the candidate
        let agent_evidence: Vec<EvidenceItem> = results
            .iter()
            .map(|r| EvidenceItem {
                id: 0,
                candidate_id: candidate.id.clone(),
                kind: agents::reporting_kind(r.kind),
                text: r.notes.clone().unwrap_or_default(),
                agent: r.kind.as_str().to_string(),
                confidence: r.score,
                context: Default::default(),
            })
            .collect();
        self.store.append_evidence(&agent_evidence).await?;

        self.store
            .record_consensus(
                session_id,
                &candidate.id,
                decision.outcome,
                decision.final_confidence,
                &results,
            )
            .await?;

        info!(
            candidate_id = %candidate.id,
            outcome = %decision.outcome,
            final_confidence = decision.final_confidence,
            "Triangulation decided"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(kind: AgentKind, score: f64, veto: bool) -> AgentResult {
        AgentResult {
            kind,
            score,
            veto,
            notes: None,
        }
    }

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            accept_threshold: 0.7,
            reject_threshold: 0.3,
            min_quorum: 3,
            agent_timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_split_opinions_defer() {
        // Scores {0.8, 0.4, 0.5}: mean ~0.57, agreement ~0.83, final ~0.47
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.8, false),
            result(AgentKind::SemanticAnalyst, 0.4, false),
            result(AgentKind::ContextualAnalyst, 0.5, false),
        ];
        let decision = consensus(&results, 3, &config());

        assert!((decision.weighted_mean - 0.5667).abs() < 0.01);
        assert!((decision.agreement - 0.83).abs() < 0.01);
        assert!((decision.final_confidence - 0.47).abs() < 0.01);
        assert_eq!(decision.outcome, ConsensusOutcome::Deferred);
    }

    #[test]
    fn test_concordant_high_scores_accept() {
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.9, false),
            result(AgentKind::SemanticAnalyst, 0.85, false),
            result(AgentKind::CrossRefAnalyst, 0.9, false),
        ];
        let decision = consensus(&results, 3, &config());
        assert_eq!(decision.outcome, ConsensusOutcome::Accepted);
    }

    #[test]
    fn test_single_veto_blocks_acceptance() {
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.9, false),
            result(AgentKind::SemanticAnalyst, 0.85, true),
            result(AgentKind::CrossRefAnalyst, 0.9, false),
        ];
        let decision = consensus(&results, 3, &config());
        assert_eq!(decision.outcome, ConsensusOutcome::Deferred);
    }

    #[test]
    fn test_two_vetoes_reject() {
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.9, true),
            result(AgentKind::SemanticAnalyst, 0.85, true),
            result(AgentKind::CrossRefAnalyst, 0.9, false),
        ];
        let decision = consensus(&results, 3, &config());
        assert_eq!(decision.outcome, ConsensusOutcome::Rejected);
    }

    #[test]
    fn test_below_quorum_defers() {
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.9, false),
            result(AgentKind::SemanticAnalyst, 0.9, false),
        ];
        let decision = consensus(&results, 6, &config());
        assert_eq!(decision.outcome, ConsensusOutcome::Deferred);
    }

    #[test]
    fn test_missing_agents_penalize_agreement() {
        let results = vec![
            result(AgentKind::SyntaxAnalyst, 0.8, false),
            result(AgentKind::SemanticAnalyst, 0.8, false),
            result(AgentKind::CrossRefAnalyst, 0.8, false),
        ];
        let full = consensus(&results, 3, &config());
        let partial = consensus(&results, 6, &config());
        assert!(partial.agreement < full.agreement);
        assert!(partial.final_confidence < full.final_confidence);
    }

    #[test]
    fn test_exact_thresholds_resolve_conservatively() {
        // Identical scores make agreement exactly 1, so final == mean
        let at_accept = vec![
            result(AgentKind::SyntaxAnalyst, 0.7, false),
            result(AgentKind::SemanticAnalyst, 0.7, false),
            result(AgentKind::CrossRefAnalyst, 0.7, false),
        ];
        let decision = consensus(&at_accept, 3, &config());
        assert_eq!(decision.final_confidence, 0.7);
        assert_eq!(decision.outcome, ConsensusOutcome::Deferred);

        let at_reject = vec![
            result(AgentKind::SyntaxAnalyst, 0.3, false),
            result(AgentKind::SemanticAnalyst, 0.3, false),
            result(AgentKind::CrossRefAnalyst, 0.3, false),
        ];
        let decision = consensus(&at_reject, 3, &config());
        assert_eq!(decision.outcome, ConsensusOutcome::Rejected);
    }
}
