//! LLM client errors.

use cartograph_protocol::ErrorClass;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited by endpoint")]
    RateLimited,

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response is not the expected shape: {0}")]
    Malformed(String),

    #[error("endpoint not configured (set LLM_ENDPOINT and LLM_API_KEY)")]
    NotConfigured,
}

impl LlmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LlmError::Timeout(_) | LlmError::RateLimited => ErrorClass::Transient,
            LlmError::Server { status, .. } if *status >= 500 => ErrorClass::Transient,
            LlmError::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            LlmError::Server { .. } | LlmError::Http(_) => ErrorClass::Fatal,
            LlmError::Malformed(_) => ErrorClass::Parse,
            LlmError::NotConfigured => ErrorClass::Fatal,
        }
    }
}
