//! LLM client trait and the HTTP implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use cartograph_protocol::LlmSettings;

use crate::error::LlmError;
use crate::rate_limit::RateLimiter;
use crate::types::{LlmRequest, LlmResponse};

/// The seam workers depend on.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt. Implementations enforce their own timeout and
    /// rate limit; callers handle retries through the queue.
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Client for any OpenAI-compatible chat completions endpoint.
pub struct HttpLlmClient {
    settings: LlmSettings,
    http: Client,
    limiter: RateLimiter,
}

impl HttpLlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        if settings.endpoint.is_empty() || settings.api_key.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let limiter = RateLimiter::per_minute(settings.rate_limit_per_min);
        Ok(Self {
            settings,
            http,
            limiter,
        })
    }
}

// OpenAI-compatible request/response shapes
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.limiter.acquire().await;

        let prompt = request.full_prompt();
        let body = ChatRequest {
            model: &self.settings.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            // Deterministic extraction, not creative writing
            temperature: 0.0,
        };

        let url = format!(
            "{}/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        );
        debug!(model = %self.settings.model, prompt_chars = prompt.len(), "LLM request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.settings.timeout_secs)
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            warn!("LLM endpoint rate limited the request");
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Malformed("response has no choices".to_string()))?;

        Ok(LlmResponse { text })
    }
}
