//! File analysis worker.
//!
//! Consumes one batch per job: builds the batch prompt, invokes the LLM,
//! routes per-file POI blocks back to their files, and persists each
//! file's result transactionally (file row, POIs, outbox events). A
//! malformed response earns exactly one stricter re-prompt; a second
//! failure marks the batch's files failed rather than failing the job.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use cartograph_db::PipelineStore;
use cartograph_llm::{extract_json, FileAnalysisWire, LlmClient, LlmRequest};
use cartograph_protocol::{BatchJob, QueueJob};

use crate::batcher::FileBatcher;
use crate::error::{PipelineError, Result};
use crate::pool::JobHandler;

pub struct FileAnalysisWorker {
    store: PipelineStore,
    llm: Arc<dyn LlmClient>,
    batcher: FileBatcher,
}

impl FileAnalysisWorker {
    pub fn new(store: PipelineStore, llm: Arc<dyn LlmClient>, batcher: FileBatcher) -> Self {
        Self {
            store,
            llm,
            batcher,
        }
    }

    /// LLM round trip with one stricter re-prompt on a parse failure.
    /// Returns `None` when both attempts produced unusable output.
    async fn analyze(&self, prompt: &str) -> Result<Option<FileAnalysisWire>> {
        let response = self
            .llm
            .complete(LlmRequest::new(prompt, FileBatcher::schema_hint()))
            .await?;
        if let Ok(wire) = extract_json::<FileAnalysisWire>(&response.text) {
            return Ok(Some(wire));
        }

        debug!("Batch response unparseable, re-prompting with strict hint");
        let retry = self
            .llm
            .complete(LlmRequest::new(prompt, FileBatcher::strict_schema_hint()))
            .await?;
        match extract_json::<FileAnalysisWire>(&retry.text) {
            Ok(wire) => Ok(Some(wire)),
            Err(e) => {
                warn!(error = %e, "Batch response unparseable after re-prompt");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobHandler for FileAnalysisWorker {
    async fn handle(&self, job: &QueueJob) -> Result<()> {
        let BatchJob { batch } = job.parse()?;

        let mut contents = HashMap::new();
        let mut missing = Vec::new();
        for entry in &batch.files {
            match std::fs::read_to_string(&entry.path) {
                Ok(text) => {
                    contents.insert(entry.path.clone(), text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // File vanished between scan and analysis
                    missing.push(entry.path.clone());
                }
                Err(e) => return Err(PipelineError::io(entry.path.clone(), e)),
            }
        }
        for path in &missing {
            self.store
                .record_file_failure(path, "file removed before analysis")
                .await?;
        }
        if contents.is_empty() {
            return Ok(());
        }

        let prompt = self.batcher.build_batch_prompt(&batch, &contents);
        let Some(wire) = self.analyze(&prompt).await? else {
            // Persistent parse failure: per-aggregate, not per-job
            for entry in &batch.files {
                if contents.contains_key(&entry.path) {
                    self.store
                        .record_file_failure(&entry.path, "LLM response unparseable")
                        .await?;
                }
            }
            return Ok(());
        };

        let outcome = self.batcher.parse_batch_response(&wire, &batch);
        if outcome.unknown_files > 0 || outcome.invalid_pois > 0 {
            warn!(
                unknown_files = outcome.unknown_files,
                invalid_pois = outcome.invalid_pois,
                "Dropped malformed response fragments"
            );
        }

        for (path, pois) in &outcome.per_file {
            if !contents.contains_key(path) {
                continue; // vanished file, already marked failed
            }
            self.store.record_file_analysis(path, pois).await?;
            debug!(path = %path, pois = pois.len(), "File analyzed");
        }
        Ok(())
    }
}
