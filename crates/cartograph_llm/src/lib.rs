//! LLM client seam for the Cartograph pipeline.
//!
//! Workers depend on the `LlmClient` trait only; the HTTP implementation
//! talks to any OpenAI-compatible chat endpoint, and the scripted client
//! serves tests and offline runs with canned responses.

pub mod client;
pub mod error;
pub mod rate_limit;
pub mod scripted;
pub mod types;

pub use client::{HttpLlmClient, LlmClient};
pub use error::LlmError;
pub use rate_limit::RateLimiter;
pub use scripted::ScriptedLlmClient;
pub use types::{
    extract_json, FileAnalysisWire, FilePoisWire, LlmRequest, LlmResponse, PoiWire,
    RelationshipHintWire, RelationshipWire, RelationshipsWire,
};
