//! File batching (amortizing LLM calls over small files).
//!
//! Small files accumulate, in insertion order, into batches bounded by a
//! character budget and a file-count cap. Files over the small-file
//! threshold pass through as single-file batches. The batcher also owns
//! prompt assembly (delimited per-file anchors) and response routing
//! (per-file POI blocks back to their source file).

use std::collections::HashMap;

use cartograph_llm::{FileAnalysisWire, PoiWire};
use cartograph_protocol::{poi_id, BatchEntry, BatchPolicy, FileBatch, Poi, PoiType};

/// Anchor line prefix delimiting one file's content inside a batch prompt.
const FILE_ANCHOR: &str = "=== FILE: ";
const FILE_ANCHOR_END: &str = " ===";

/// Result of routing an LLM batch response back to its files.
#[derive(Debug, Default)]
pub struct BatchParseOutcome {
    /// POIs per batch file. Every file of the batch appears, files the
    /// model skipped map to an empty list.
    pub per_file: Vec<(String, Vec<Poi>)>,
    /// Response blocks whose anchor matched no batch file.
    pub unknown_files: usize,
    /// POIs dropped for failing field validation.
    pub invalid_pois: usize,
}

pub struct FileBatcher {
    policy: BatchPolicy,
}

impl FileBatcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    /// Group files into batches.
    ///
    /// Batchable files (size <= threshold) accumulate in insertion order;
    /// a batch closes when adding the next file would exceed the char
    /// budget or the file-count cap. Larger files each become a
    /// single-file batch flagged `is_single_large_file`, emitted after the
    /// small-file batches.
    pub fn plan(&self, files: &[(String, u64)]) -> Vec<FileBatch> {
        let mut batches = Vec::new();
        let mut large = Vec::new();
        let mut current: Vec<BatchEntry> = Vec::new();
        let mut current_chars = 0usize;

        let flush =
            |current: &mut Vec<BatchEntry>, current_chars: &mut usize, out: &mut Vec<FileBatch>| {
                if current.is_empty() {
                    return;
                }
                out.push(FileBatch {
                    files: std::mem::take(current),
                    total_chars: *current_chars,
                    is_single_large_file: false,
                });
                *current_chars = 0;
            };

        for (path, size) in files {
            let chars = *size as usize;

            if !self.policy.enabled || *size > self.policy.small_file_threshold {
                large.push(FileBatch {
                    files: vec![entry(path, chars, 0)],
                    total_chars: chars,
                    is_single_large_file: *size > self.policy.small_file_threshold,
                });
                continue;
            }

            let over_chars = current_chars + chars > self.policy.max_batch_chars;
            let over_count = current.len() + 1 > self.policy.max_files_per_batch;
            if !current.is_empty() && (over_chars || over_count) {
                flush(&mut current, &mut current_chars, &mut batches);
            }

            current.push(entry(path, chars, current_chars));
            current_chars += chars;

            // A lone file over the char budget cannot be split further
            if current_chars > self.policy.max_batch_chars {
                flush(&mut current, &mut current_chars, &mut batches);
            }
        }
        flush(&mut current, &mut current_chars, &mut batches);

        batches.extend(large);
        batches
    }

    /// Deterministic multi-file prompt with per-file anchors.
    pub fn build_batch_prompt(&self, batch: &FileBatch, contents: &HashMap<String, String>) -> String {
        let mut prompt = String::with_capacity(batch.total_chars + 512);
        prompt.push_str(
            "Extract every point of interest (functions, classes, methods, variables, \
             imports, tables, constants) from each file below.\n\n",
        );
        for entry in &batch.files {
            prompt.push_str(FILE_ANCHOR);
            prompt.push_str(&entry.path);
            prompt.push_str(FILE_ANCHOR_END);
            prompt.push('\n');
            if let Some(content) = contents.get(&entry.path) {
                prompt.push_str(content);
            }
            prompt.push('\n');
        }
        prompt
    }

    /// Schema hint appended to every batch prompt.
    pub fn schema_hint() -> &'static str {
        r#"Respond with JSON only:
{"files": [{"filePath": "<path>", "pois": [{"name": "<name>", "type": "function|class|method|variable|import|table|constant", "start_line": 1, "end_line": 2}]}]}"#
    }

    /// Stricter hint for the one re-prompt after a parse failure.
    pub fn strict_schema_hint() -> &'static str {
        r#"Your previous answer was not valid JSON. Respond with EXACTLY one JSON object, no prose, no markdown fences:
{"files": [{"filePath": "<path>", "pois": [{"name": "<name>", "type": "function", "start_line": 1, "end_line": 2}]}]}"#
    }

    /// Route each per-file POI block back to its source file.
    ///
    /// Unknown anchors are dropped and counted; invalid POIs are dropped
    /// and counted; every batch file appears in the output.
    pub fn parse_batch_response(
        &self,
        response: &FileAnalysisWire,
        batch: &FileBatch,
    ) -> BatchParseOutcome {
        let mut outcome = BatchParseOutcome::default();
        let mut by_path: HashMap<&str, Vec<Poi>> = HashMap::new();

        for file_block in &response.files {
            let Some(entry) = batch.files.iter().find(|e| e.path == file_block.file_path)
            else {
                outcome.unknown_files += 1;
                continue;
            };
            let pois = by_path.entry(entry.path.as_str()).or_default();
            for wire in &file_block.pois {
                match validate_poi(&entry.path, wire) {
                    Some(poi) => pois.push(poi),
                    None => outcome.invalid_pois += 1,
                }
            }
        }

        for entry in &batch.files {
            let pois = by_path.remove(entry.path.as_str()).unwrap_or_default();
            outcome.per_file.push((entry.path.clone(), pois));
        }
        outcome
    }
}

fn entry(path: &str, chars: usize, offset: usize) -> BatchEntry {
    let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
    BatchEntry {
        file_name,
        path: path.to_string(),
        chars,
        offset,
    }
}

fn validate_poi(file_path: &str, wire: &PoiWire) -> Option<Poi> {
    if wire.name.trim().is_empty() {
        return None;
    }
    if wire.start_line == 0 || wire.end_line < wire.start_line {
        return None;
    }
    let poi_type: PoiType = wire.poi_type.parse().unwrap_or(PoiType::Other);
    let id = poi_id(
        file_path,
        &wire.name,
        poi_type.as_str(),
        wire.start_line,
        wire.end_line,
    );
    Some(Poi {
        id,
        file_path: file_path.to_string(),
        name: wire.name.clone(),
        poi_type,
        start_line: wire.start_line,
        end_line: wire.end_line,
        excerpt: wire.excerpt.clone(),
    })
}
