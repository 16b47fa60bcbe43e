//! Scripted LLM client for tests and offline runs.
//!
//! Responses are keyed by a substring matched against the prompt; the
//! first matching rule wins. Calls are counted so tests can assert how
//! many LLM round-trips a scenario cost.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::client::LlmClient;
use crate::error::LlmError;
use crate::types::{LlmRequest, LlmResponse};

struct Rule {
    needle: String,
    response: String,
}

#[derive(Default)]
pub struct ScriptedLlmClient {
    rules: Mutex<Vec<Rule>>,
    fallback: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `response` whenever the prompt contains `needle`.
    pub fn respond_when(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules
            .lock()
            .expect("scripted client poisoned")
            .push(Rule {
                needle: needle.into(),
                response: response.into(),
            });
        self
    }

    /// Respond with `response` when no rule matches.
    pub fn respond_default(self, response: impl Into<String>) -> Self {
        *self.fallback.lock().expect("scripted client poisoned") = Some(response.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.full_prompt();

        let rules = self.rules.lock().expect("scripted client poisoned");
        for rule in rules.iter() {
            if prompt.contains(&rule.needle) {
                return Ok(LlmResponse {
                    text: rule.response.clone(),
                });
            }
        }
        drop(rules);

        match self.fallback.lock().expect("scripted client poisoned").clone() {
            Some(text) => Ok(LlmResponse { text }),
            None => Err(LlmError::Malformed(format!(
                "no scripted response matches prompt ({} chars)",
                prompt.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routing_and_counting() {
        let client = ScriptedLlmClient::new()
            .respond_when("alpha.rs", r#"{"files": []}"#)
            .respond_default(r#"{"relationships": []}"#);

        let a = client
            .complete(LlmRequest::new("analyze alpha.rs please", ""))
            .await
            .unwrap();
        assert!(a.text.contains("files"));

        let b = client
            .complete(LlmRequest::new("something else", ""))
            .await
            .unwrap();
        assert!(b.text.contains("relationships"));

        assert_eq!(client.call_count(), 2);
    }
}
