//! Triangulation sub-agents.
//!
//! Each analyst re-scores an escalated candidate from its own disjoint
//! slice of the evidence, so the opinions the consensus combines are
//! independent. The roster is a fixed tagged set: adding an analyst means
//! extending `AgentKind` and the dispatch below.

use cartograph_protocol::{AgentKind, AgentResult, EvidenceItem, EvidenceKind, RelationshipCandidate};

/// Evidence kind an agent writes its own findings as.
pub fn reporting_kind(kind: AgentKind) -> EvidenceKind {
    match kind {
        AgentKind::SyntaxAnalyst => EvidenceKind::SyntaxPattern,
        AgentKind::SemanticAnalyst => EvidenceKind::SemanticDomain,
        AgentKind::ContextualAnalyst => EvidenceKind::LlmReasoning,
        AgentKind::CrossRefAnalyst => EvidenceKind::CrossReference,
        AgentKind::ArchitecturalAnalyst => EvidenceKind::ArchitecturalPattern,
        AgentKind::DynamicAnalyst => EvidenceKind::DynamicPattern,
    }
}

/// Re-score a candidate through one analyst's lens.
///
/// With evidence in its slice, the agent's opinion is the slice mean plus
/// a lens-specific adjustment. Without evidence it falls back to a weak
/// prior pulled toward 0.5, so a sparse slice neither endorses nor
/// condemns. Conflicting evidence in the slice is a veto.
pub fn assess(
    kind: AgentKind,
    candidate: &RelationshipCandidate,
    subset: &[EvidenceItem],
) -> AgentResult {
    let base = if subset.is_empty() {
        0.5 * candidate.confidence.clamp(0.0, 1.0) + 0.25
    } else {
        subset.iter().map(|e| e.confidence.clamp(0.0, 1.0)).sum::<f64>() / subset.len() as f64
    };

    let adjustment = match kind {
        AgentKind::SyntaxAnalyst => {
            // An explicit syntactic match is the strongest single signal
            if subset.iter().any(|e| e.confidence >= 0.8) {
                0.05
            } else {
                0.0
            }
        }
        AgentKind::SemanticAnalyst => {
            if subset.len() >= 2 {
                0.05 // corroborated across domain evidence
            } else {
                0.0
            }
        }
        AgentKind::ContextualAnalyst => {
            if candidate.target_poi_id.is_none() {
                -0.05 // reasoning about an unresolved symbol
            } else {
                0.0
            }
        }
        AgentKind::CrossRefAnalyst => {
            if subset.len() >= 2 {
                0.1 // multiple independent references
            } else {
                0.0
            }
        }
        AgentKind::ArchitecturalAnalyst => {
            if subset.iter().any(|e| e.confidence >= 0.7) {
                0.05
            } else {
                0.0
            }
        }
        AgentKind::DynamicAnalyst => {
            if subset.iter().any(|e| e.context_flag("dynamic_import")) {
                -0.1 // dynamic dispatch defeats static certainty
            } else {
                0.0
            }
        }
    };

    let veto = subset.iter().any(|e| e.context_flag("conflict"));
    let score = (base + adjustment).clamp(0.0, 1.0);

    AgentResult {
        kind,
        score,
        veto,
        notes: Some(if subset.is_empty() {
            format!("{}: no evidence in slice, weak prior", kind.as_str())
        } else {
            format!(
                "{}: {} evidence items, slice mean {:.2}",
                kind.as_str(),
                subset.len(),
                base
            )
        }),
    }
}

/// The evidence slice an agent is allowed to see.
pub fn evidence_slice(kind: AgentKind, evidence: &[EvidenceItem]) -> Vec<EvidenceItem> {
    evidence
        .iter()
        .filter(|e| kind.evidence_kinds().contains(&e.kind))
        .cloned()
        .collect()
}
