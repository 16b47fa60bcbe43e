//! LLM wire format.
//!
//! Two response shapes: batch analysis returns per-file POI lists,
//! relationship resolution returns candidate edges. Unrecognized fields
//! are ignored; missing required fields invalidate only the record that
//! carries them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::LlmError;

/// A single completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    /// Appended to the prompt to steer the model toward the JSON shape.
    pub schema_hint: String,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>, schema_hint: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            schema_hint: schema_hint.into(),
        }
    }

    /// Full text sent to the model.
    pub fn full_prompt(&self) -> String {
        if self.schema_hint.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}\n\n{}", self.prompt, self.schema_hint)
        }
    }
}

/// Raw completion text.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
}

// ============================================================================
// Batch analysis shape
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoiWire {
    pub name: String,
    #[serde(rename = "type")]
    pub poi_type: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilePoisWire {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub pois: Vec<PoiWire>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileAnalysisWire {
    pub files: Vec<FilePoisWire>,
}

// ============================================================================
// Relationship resolution shape
// ============================================================================

/// A structured hint the model attaches alongside its reasoning; each
/// becomes an extra evidence item.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationshipHintWire {
    pub kind: String,
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationshipWire {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub reason: String,
    /// Primary free-text justification.
    #[serde(default)]
    pub evidence: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub hints: Vec<RelationshipHintWire>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationshipsWire {
    pub relationships: Vec<RelationshipWire>,
}

/// Extract and parse the first JSON object in a completion.
///
/// Models wrap JSON in prose and markdown fences; everything outside the
/// outermost braces is ignored.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let start = text
        .find('{')
        .ok_or_else(|| LlmError::Malformed("no JSON object in response".to_string()))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| LlmError::Malformed("unterminated JSON object".to_string()))?;
    if end < start {
        return Err(LlmError::Malformed("unterminated JSON object".to_string()));
    }
    serde_json::from_str(&text[start..=end]).map_err(|e| LlmError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_ignores_fences() {
        let text = "Here you go:\n```json\n{\"files\": []}\n```\nDone.";
        let parsed: FileAnalysisWire = extract_json(text).unwrap();
        assert!(parsed.files.is_empty());
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        let err = extract_json::<FileAnalysisWire>("no json here").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[test]
    fn test_relationship_wire_tolerates_unknown_fields() {
        let raw = r#"{
            "relationships": [{
                "from": "main", "to": "helper", "type": "CALLS",
                "reason": "direct call", "confidence": 0.9,
                "novel_field": 42
            }]
        }"#;
        let parsed: RelationshipsWire = extract_json(raw).unwrap();
        assert_eq!(parsed.relationships.len(), 1);
        assert!(parsed.relationships[0].hints.is_empty());
    }
}
