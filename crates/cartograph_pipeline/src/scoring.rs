//! Confidence scoring (pure, deterministic, config-driven).
//!
//! The scorer maps (candidate, ordered evidence) to a full breakdown:
//! per-factor scores, a weighted mean over the factors that actually have
//! evidence, a penalty factor from context flags, and an uncertainty
//! adjustment that rises with evidence count and falls with disagreement.
//! Factors with no evidence report the neutral 0.5 in the breakdown but
//! carry no weight; weighting them would let two defaults drown out two
//! strong observations.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use cartograph_db::PipelineStore;
use cartograph_protocol::{
    CandidateStatus, ConfidenceBreakdown, ConfidenceLevel, EscalationTrigger, EvidenceItem,
    EvidenceKind, FactorScores, QueueJob, RelationshipCandidate, ScorerConfig, ScoringJob,
    SessionPhase, TriangulationSession,
};

use crate::error::Result;
use crate::pool::JobHandler;

use cartograph_protocol::config::defaults::NEUTRAL_FACTOR;

/// Max evidence confidence for a set of kinds, `None` when no evidence of
/// those kinds exists.
fn factor(evidence: &[EvidenceItem], kinds: &[EvidenceKind]) -> Option<f64> {
    evidence
        .iter()
        .filter(|e| kinds.contains(&e.kind))
        .map(|e| e.confidence.clamp(0.0, 1.0))
        .fold(None, |acc, c| Some(acc.map_or(c, |a: f64| a.max(c))))
}

/// Uncertainty adjustment: monotonically increasing in evidence count,
/// decreasing in inter-evidence spread.
pub fn uncertainty_adjustment(evidence_count: usize, stddev: f64) -> f64 {
    let base = (0.55 + 0.15 * evidence_count as f64).min(1.0);
    (base - stddev).clamp(0.0, 1.0)
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    // Summation order must not leak into the result: identical evidence in
    // any permutation has to score bit-identically.
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let variance =
        sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sorted.len() as f64;
    variance.sqrt()
}

/// True when any evidence item carries a truthy context flag.
fn any_flag(evidence: &[EvidenceItem], key: &str) -> bool {
    evidence.iter().any(|e| e.context_flag(key))
}

/// Score one candidate. Pure: identical inputs and config produce an
/// identical breakdown, and evidence order does not matter.
pub fn score_candidate(
    candidate: &RelationshipCandidate,
    evidence: &[EvidenceItem],
    config: &ScorerConfig,
) -> ConfidenceBreakdown {
    let _ = candidate; // identity does not influence the math

    let syntax = factor(evidence, &[EvidenceKind::SyntaxPattern]);
    let semantic = factor(
        evidence,
        &[
            EvidenceKind::SemanticDomain,
            EvidenceKind::DomainConsistency,
            EvidenceKind::LlmReasoning,
        ],
    );
    let context = factor(
        evidence,
        &[
            EvidenceKind::ArchitecturalPattern,
            EvidenceKind::ApiIntegration,
        ],
    );
    let cross_ref = factor(evidence, &[EvidenceKind::CrossReference]);

    let w = &config.weights;
    let mut weight_sum = 0.0;
    let mut acc = 0.0;
    for (value, weight) in [
        (syntax, w.syntax),
        (semantic, w.semantic),
        (context, w.context),
        (cross_ref, w.cross_ref),
    ] {
        if let Some(v) = value {
            acc += v * weight;
            weight_sum += weight;
        }
    }
    let weighted_sum = if weight_sum > 0.0 {
        acc / weight_sum
    } else {
        NEUTRAL_FACTOR
    };

    let p = &config.penalties;
    let mut penalty = 1.0;
    if any_flag(evidence, "dynamic_import") {
        penalty += p.dynamic_import;
    }
    if any_flag(evidence, "indirect_ref") {
        penalty += p.indirect_ref;
    }
    if any_flag(evidence, "conflict") {
        penalty += p.conflict;
    }
    if any_flag(evidence, "ambiguous") {
        penalty += p.ambiguous;
    }
    let penalty_factor = penalty.clamp(0.0, 1.0);

    let confidences: Vec<f64> = evidence
        .iter()
        .map(|e| e.confidence.clamp(0.0, 1.0))
        .collect();
    let spread = population_stddev(&confidences);
    let uncertainty = uncertainty_adjustment(evidence.len(), spread);

    let raw_score = weighted_sum * penalty_factor;
    let final_confidence = (raw_score * uncertainty).clamp(0.0, 1.0);
    let level = ConfidenceLevel::from_score(final_confidence);

    let mut fired = Vec::new();
    for trigger in &config.triggers {
        let fires = match trigger {
            EscalationTrigger::LowConfidence => final_confidence < config.escalation_threshold,
            EscalationTrigger::HighUncertainty => {
                uncertainty < config.high_uncertainty_threshold
            }
            EscalationTrigger::ConflictingEvidence => any_flag(evidence, "conflict"),
        };
        if fires {
            fired.push(trigger.as_str().to_string());
        }
    }
    let escalation_needed = !fired.is_empty();

    ConfidenceBreakdown {
        factors: FactorScores {
            syntax: syntax.unwrap_or(NEUTRAL_FACTOR),
            semantic: semantic.unwrap_or(NEUTRAL_FACTOR),
            context: context.unwrap_or(NEUTRAL_FACTOR),
            cross_ref: cross_ref.unwrap_or(NEUTRAL_FACTOR),
        },
        weighted_sum,
        penalty_factor,
        uncertainty_adjustment: uncertainty,
        raw_score,
        final_confidence,
        level,
        escalation_needed,
        fired_triggers: fired,
    }
}

/// Worker that scores `candidate-scoring` jobs and routes the result:
/// accept straight through, or escalate into a triangulation session.
pub struct ScoringWorker {
    store: PipelineStore,
    config: ScorerConfig,
}

impl ScoringWorker {
    pub fn new(store: PipelineStore, config: ScorerConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl JobHandler for ScoringWorker {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let payload: ScoringJob = job.parse()?;
        let Some(candidate) = self.store.candidate(&payload.candidate_id).await? else {
            debug!(candidate_id = %payload.candidate_id, "Candidate vanished, dropping job");
            return Ok(());
        };
        if candidate.status != CandidateStatus::Pending {
            // Redelivery after a crash between decision and ack
            return Ok(());
        }

        let evidence = self.store.evidence_for(&candidate.id).await?;
        let breakdown = score_candidate(&candidate, &evidence, &self.config);
        debug!(
            candidate_id = %candidate.id,
            confidence = breakdown.final_confidence,
            level = %breakdown.level,
            escalate = breakdown.escalation_needed,
            "Scored candidate"
        );

        if breakdown.escalation_needed {
            let session = TriangulationSession {
                id: Uuid::new_v4().to_string(),
                candidate_id: candidate.id.clone(),
                started_at: chrono::Utc::now(),
                phase: SessionPhase::Queued,
                agent_results: vec![],
                outcome: None,
                final_confidence: None,
            };
            self.store
                .record_escalation(&candidate.id, &breakdown, &session)
                .await?;
        } else {
            self.store
                .record_acceptance(&candidate.id, &breakdown)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_protocol::{candidate_id, poi_id, RelationshipType};
    use std::collections::HashMap;

    fn candidate() -> RelationshipCandidate {
        let source = poi_id("src/lib.rs", "connect", "function", 1, 10);
        RelationshipCandidate {
            id: candidate_id(&source, "Pool::new", "CALLS", "src/lib.rs"),
            source_poi_id: source,
            target_poi_id: None,
            target_name: "Pool::new".to_string(),
            resolution_hint: None,
            rel_type: RelationshipType::Calls,
            file_path: "src/lib.rs".to_string(),
            reason: "call".to_string(),
            confidence: 0.0,
            status: CandidateStatus::Pending,
        }
    }

    fn evidence(kind: EvidenceKind, confidence: f64) -> EvidenceItem {
        EvidenceItem {
            id: 0,
            candidate_id: candidate().id,
            kind,
            text: "test".to_string(),
            agent: "llm".to_string(),
            confidence,
            context: HashMap::new(),
        }
    }

    fn evidence_with_flag(kind: EvidenceKind, confidence: f64, flag: &str) -> EvidenceItem {
        let mut item = evidence(kind, confidence);
        item.context
            .insert(flag.to_string(), serde_json::Value::Bool(true));
        item
    }

    #[test]
    fn test_strong_evidence_scores_high() {
        // Strong syntax + reasoning + domain evidence, no penalties
        let items = vec![
            evidence(EvidenceKind::SyntaxPattern, 0.95),
            evidence(EvidenceKind::LlmReasoning, 0.9),
            evidence(EvidenceKind::SemanticDomain, 0.8),
        ];
        let breakdown = score_candidate(&candidate(), &items, &ScorerConfig::default());

        assert!(breakdown.final_confidence >= 0.80);
        assert!(breakdown.final_confidence <= 0.95);
        assert_eq!(breakdown.level, ConfidenceLevel::High);
        assert!(!breakdown.escalation_needed);
        assert_eq!(breakdown.penalty_factor, 1.0);
    }

    #[test]
    fn test_weak_dynamic_evidence_escalates() {
        // Weak reasoning + a dynamic-import pattern: penalty applies and
        // the result falls under the escalation threshold.
        let items = vec![
            evidence(EvidenceKind::LlmReasoning, 0.3),
            evidence_with_flag(EvidenceKind::DynamicPattern, 0.2, "dynamic_import"),
        ];
        let breakdown = score_candidate(&candidate(), &items, &ScorerConfig::default());

        assert!((breakdown.penalty_factor - 0.85).abs() < 1e-9);
        assert!(breakdown.final_confidence < 0.5);
        assert!(breakdown.escalation_needed);
        assert!(breakdown
            .fired_triggers
            .contains(&"LOW_CONFIDENCE".to_string()));
    }

    #[test]
    fn test_conflict_flag_triggers_escalation_regardless_of_score() {
        let items = vec![
            evidence(EvidenceKind::SyntaxPattern, 0.95),
            evidence(EvidenceKind::LlmReasoning, 0.95),
            evidence_with_flag(EvidenceKind::SemanticDomain, 0.9, "conflict"),
        ];
        let breakdown = score_candidate(&candidate(), &items, &ScorerConfig::default());
        assert!(breakdown
            .fired_triggers
            .contains(&"CONFLICTING_EVIDENCE".to_string()));
        assert!(breakdown.escalation_needed);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let items = vec![
            evidence(EvidenceKind::SyntaxPattern, 0.7),
            evidence(EvidenceKind::CrossReference, 0.6),
        ];
        let config = ScorerConfig::default();
        let a = score_candidate(&candidate(), &items, &config);
        let b = score_candidate(&candidate(), &items, &config);
        assert_eq!(a.final_confidence, b.final_confidence);
        assert_eq!(a.fired_triggers, b.fired_triggers);
    }

    #[test]
    fn test_permutation_invariance() {
        let mut items = vec![
            evidence(EvidenceKind::SyntaxPattern, 0.7),
            evidence(EvidenceKind::LlmReasoning, 0.5),
            evidence(EvidenceKind::CrossReference, 0.9),
        ];
        let config = ScorerConfig::default();
        let forward = score_candidate(&candidate(), &items, &config);
        items.reverse();
        let backward = score_candidate(&candidate(), &items, &config);
        assert_eq!(forward.final_confidence, backward.final_confidence);
    }

    #[test]
    fn test_uncertainty_monotone_in_count_and_spread() {
        for n in 0..8 {
            assert!(uncertainty_adjustment(n + 1, 0.1) >= uncertainty_adjustment(n, 0.1));
        }
        assert!(uncertainty_adjustment(3, 0.05) > uncertainty_adjustment(3, 0.2));
    }

    #[test]
    fn test_penalty_clamps_at_zero() {
        let items = vec![
            evidence_with_flag(EvidenceKind::LlmReasoning, 0.5, "conflict"),
            evidence_with_flag(EvidenceKind::DynamicPattern, 0.5, "dynamic_import"),
            evidence_with_flag(EvidenceKind::SemanticDomain, 0.5, "indirect_ref"),
            evidence_with_flag(EvidenceKind::SyntaxPattern, 0.5, "ambiguous"),
        ];
        let mut config = ScorerConfig::default();
        config.penalties.conflict = -0.9;
        config.penalties.dynamic_import = -0.9;
        let breakdown = score_candidate(&candidate(), &items, &config);
        assert!(breakdown.penalty_factor >= 0.0);
        assert!(breakdown.final_confidence >= 0.0);
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        fn arb_kind() -> impl Strategy<Value = EvidenceKind> {
            prop_oneof![
                Just(EvidenceKind::LlmReasoning),
                Just(EvidenceKind::SyntaxPattern),
                Just(EvidenceKind::SemanticDomain),
                Just(EvidenceKind::ArchitecturalPattern),
                Just(EvidenceKind::CrossReference),
                Just(EvidenceKind::DynamicPattern),
                Just(EvidenceKind::ApiIntegration),
                Just(EvidenceKind::DomainConsistency),
            ]
        }

        fn arb_evidence() -> impl Strategy<Value = Vec<EvidenceItem>> {
            prop::collection::vec((arb_kind(), 0.0f64..=1.0), 1..12).prop_map(|items| {
                items
                    .into_iter()
                    .map(|(kind, confidence)| evidence(kind, confidence))
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn final_confidence_always_in_unit_interval(items in arb_evidence()) {
                let b = score_candidate(&candidate(), &items, &ScorerConfig::default());
                prop_assert!((0.0..=1.0).contains(&b.final_confidence));
                prop_assert!((0.0..=1.0).contains(&b.weighted_sum));
                prop_assert!((0.0..=1.0).contains(&b.penalty_factor));
                prop_assert!((0.0..=1.0).contains(&b.uncertainty_adjustment));
            }

            #[test]
            fn score_is_pure(items in arb_evidence()) {
                let config = ScorerConfig::default();
                let a = score_candidate(&candidate(), &items, &config);
                let b = score_candidate(&candidate(), &items, &config);
                prop_assert_eq!(a.final_confidence, b.final_confidence);
            }

            #[test]
            fn score_ignores_evidence_order(items in arb_evidence(), rotate in 0usize..12) {
                let config = ScorerConfig::default();
                let baseline = score_candidate(&candidate(), &items, &config);
                let mut rotated = items.clone();
                rotated.rotate_left(rotate % items.len().max(1));
                let shuffled = score_candidate(&candidate(), &rotated, &config);
                prop_assert_eq!(baseline.final_confidence, shuffled.final_confidence);
            }
        }
    }
}
