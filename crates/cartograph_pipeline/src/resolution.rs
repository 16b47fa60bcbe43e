//! Relationship resolution worker.
//!
//! For one file's POIs, asks the LLM for outgoing relationships and
//! persists each candidate with at least one evidence item (the model's
//! reasoning), plus extra evidence for any structured hints it returned.
//! Targets that name a known POI resolve immediately; the rest keep their
//! symbolic name for late resolution.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

use cartograph_db::PipelineStore;
use cartograph_llm::{extract_json, LlmClient, LlmRequest, RelationshipsWire};
use cartograph_protocol::{
    candidate_id, CandidateStatus, EvidenceItem, EvidenceKind, Poi, QueueJob,
    RelationshipCandidate, RelationshipRequestJob, RelationshipType,
};

use crate::error::Result;
use crate::pool::JobHandler;

const SCHEMA_HINT: &str = r#"Respond with JSON only:
{"relationships": [{"from": "<poi name>", "to": "<target name>", "type": "CALLS|USES|IMPORTS|EXTENDS|CONTAINS|IMPLEMENTS|REFERENCES", "reason": "<why>", "confidence": 0.0, "context": {}, "hints": [{"kind": "SYNTAX_PATTERN", "text": "<pattern>", "confidence": 0.0}]}]}"#;

const STRICT_SCHEMA_HINT: &str = r#"Your previous answer was not valid JSON. Respond with EXACTLY one JSON object, no prose, no markdown fences:
{"relationships": [{"from": "<poi name>", "to": "<target name>", "type": "CALLS", "reason": "<why>", "confidence": 0.5}]}"#;

pub struct RelationshipResolutionWorker {
    store: PipelineStore,
    llm: Arc<dyn LlmClient>,
}

impl RelationshipResolutionWorker {
    pub fn new(store: PipelineStore, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, llm }
    }

    fn build_prompt(file_path: &str, pois: &[Poi]) -> String {
        let mut prompt = String::with_capacity(256 + pois.len() * 64);
        let _ = writeln!(
            prompt,
            "The file {file_path} contains these points of interest:"
        );
        for poi in pois {
            let _ = writeln!(
                prompt,
                "- {} ({}, lines {}-{})",
                poi.name,
                poi.poi_type.as_str(),
                poi.start_line,
                poi.end_line
            );
        }
        prompt.push_str(
            "\nList every relationship from these points of interest to other code \
             entities (in this file or elsewhere), with your reasoning and a confidence.",
        );
        prompt
    }

    async fn resolve(&self, prompt: &str) -> Result<Option<RelationshipsWire>> {
        let response = self
            .llm
            .complete(LlmRequest::new(prompt, SCHEMA_HINT))
            .await?;
        if let Ok(wire) = extract_json::<RelationshipsWire>(&response.text) {
            return Ok(Some(wire));
        }

        debug!("Relationship response unparseable, re-prompting with strict hint");
        let retry = self
            .llm
            .complete(LlmRequest::new(prompt, STRICT_SCHEMA_HINT))
            .await?;
        match extract_json::<RelationshipsWire>(&retry.text) {
            Ok(wire) => Ok(Some(wire)),
            Err(e) => {
                warn!(error = %e, "Relationship response unparseable after re-prompt");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobHandler for RelationshipResolutionWorker {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let RelationshipRequestJob { file_path } = job.parse()?;

        let pois = self.store.pois_for_file(&file_path).await?;
        if pois.is_empty() {
            debug!(file_path = %file_path, "No POIs, nothing to resolve");
            return Ok(());
        }

        let prompt = Self::build_prompt(&file_path, &pois);
        let Some(wire) = self.resolve(&prompt).await? else {
            // No candidates from this aggregate; the file stays analyzed
            return Ok(());
        };

        let mut candidates = Vec::new();
        let mut dropped = 0usize;
        for rel in &wire.relationships {
            let Some(source) = pois.iter().find(|p| p.name == rel.from) else {
                dropped += 1;
                continue;
            };
            if rel.to.trim().is_empty() {
                dropped += 1;
                continue;
            }
            let rel_type: RelationshipType =
                rel.rel_type.parse().unwrap_or(RelationshipType::Other);
            let target = self.store.resolve_poi(&rel.to, &file_path).await?;
            let confidence = rel.confidence.clamp(0.0, 1.0);

            let id = candidate_id(&source.id, &rel.to, rel_type.as_str(), &file_path);
            let candidate = RelationshipCandidate {
                id: id.clone(),
                source_poi_id: source.id.clone(),
                target_poi_id: target.map(|t| t.id),
                target_name: rel.to.clone(),
                resolution_hint: rel.context.get("resolution_hint").and_then(|v| {
                    v.as_str().map(str::to_string)
                }),
                rel_type,
                file_path: file_path.clone(),
                reason: rel.reason.clone(),
                confidence,
                status: CandidateStatus::Pending,
            };

            // Primary evidence: the model's own reasoning
            let mut evidence = vec![EvidenceItem {
                id: 0,
                candidate_id: id.clone(),
                kind: EvidenceKind::LlmReasoning,
                text: rel.evidence.clone().unwrap_or_else(|| rel.reason.clone()),
                agent: "llm".to_string(),
                confidence,
                context: rel.context.clone(),
            }];
            // Structured hints become additional evidence
            for hint in &rel.hints {
                let Ok(kind) = hint.kind.parse::<EvidenceKind>() else {
                    dropped += 1;
                    continue;
                };
                evidence.push(EvidenceItem {
                    id: 0,
                    candidate_id: id.clone(),
                    kind,
                    text: hint.text.clone(),
                    agent: "llm".to_string(),
                    confidence: hint.confidence.clamp(0.0, 1.0),
                    context: hint.context.clone(),
                });
            }

            candidates.push((candidate, evidence));
        }

        if dropped > 0 {
            warn!(file_path = %file_path, dropped, "Dropped malformed relationship records");
        }
        let inserted = self.store.insert_candidates(&candidates).await?;
        debug!(file_path = %file_path, inserted, "Candidates persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::CartographDb;
    use cartograph_llm::ScriptedLlmClient;
    use cartograph_protocol::{poi_id, JobState, PoiType};

    async fn db_with_pois() -> CartographDb {
        let db = CartographDb::connect_memory().await.unwrap();
        let store = db.store();
        store
            .upsert_scanned_file("src/lib.rs", "hash", 100)
            .await
            .unwrap();
        let pois = vec![
            Poi {
                id: poi_id("src/lib.rs", "connect", "function", 1, 10),
                file_path: "src/lib.rs".to_string(),
                name: "connect".to_string(),
                poi_type: PoiType::Function,
                start_line: 1,
                end_line: 10,
                excerpt: None,
            },
            Poi {
                id: poi_id("src/lib.rs", "Pool", "class", 12, 40),
                file_path: "src/lib.rs".to_string(),
                name: "Pool".to_string(),
                poi_type: PoiType::Class,
                start_line: 12,
                end_line: 40,
                excerpt: None,
            },
        ];
        store.record_file_analysis("src/lib.rs", &pois).await.unwrap();
        db
    }

    fn request_job() -> QueueJob {
        QueueJob {
            id: 7,
            queue: cartograph_protocol::queues::RELATIONSHIP_RESOLUTION.to_string(),
            payload: serde_json::json!({"file_path": "src/lib.rs"}),
            attempts: 1,
            max_attempts: 3,
            priority: 0,
            state: JobState::Active,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_candidates_persisted_with_evidence() {
        let db = db_with_pois().await;
        let llm = Arc::new(ScriptedLlmClient::new().respond_default(
            r#"{"relationships": [
                {"from": "connect", "to": "Pool", "type": "USES", "reason": "builds a pool",
                 "confidence": 0.9,
                 "hints": [{"kind": "SYNTAX_PATTERN", "text": "Pool::new(", "confidence": 0.95}]},
                {"from": "ghost", "to": "Pool", "type": "USES", "reason": "unknown source",
                 "confidence": 0.9}
            ]}"#,
        ));

        let worker = RelationshipResolutionWorker::new(db.store(), llm);
        worker.handle(&request_job()).await.unwrap();

        let counts = db.store().counts().await.unwrap();
        // The record with an unknown source POI was dropped
        assert_eq!(counts.candidates_pending, 1);
        assert_eq!(counts.evidence, 2);

        // Target resolved to the Pool POI in the same file
        let source = poi_id("src/lib.rs", "connect", "function", 1, 10);
        let id = candidate_id(&source, "Pool", "USES", "src/lib.rs");
        let candidate = db.store().candidate(&id).await.unwrap().unwrap();
        assert!(candidate.target_poi_id.is_some());
    }

    #[tokio::test]
    async fn test_empty_poi_file_skips_llm() {
        let db = CartographDb::connect_memory().await.unwrap();
        db.store()
            .upsert_scanned_file("src/empty.rs", "hash", 1)
            .await
            .unwrap();
        db.store()
            .record_file_analysis("src/empty.rs", &[])
            .await
            .unwrap();

        let llm = Arc::new(ScriptedLlmClient::new());
        let worker = RelationshipResolutionWorker::new(db.store(), Arc::clone(&llm) as Arc<dyn LlmClient>);
        let mut job = request_job();
        job.payload = serde_json::json!({"file_path": "src/empty.rs"});
        worker.handle(&job).await.unwrap();
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let db = db_with_pois().await;
        let llm = Arc::new(ScriptedLlmClient::new().respond_default(
            r#"{"relationships": [{"from": "connect", "to": "Pool", "type": "USES",
                "reason": "builds a pool", "confidence": 0.9}]}"#,
        ));
        let worker = RelationshipResolutionWorker::new(db.store(), llm);

        worker.handle(&request_job()).await.unwrap();
        worker.handle(&request_job()).await.unwrap();

        let counts = db.store().counts().await.unwrap();
        assert_eq!(counts.candidates_pending, 1);
        assert_eq!(counts.evidence, 1);
    }
}
