//! Pipeline configuration, loaded from the environment with compiled
//! defaults.
//!
//! Every tunable named in the external contract is read here once, at
//! startup; workers receive config by value and never consult the
//! environment themselves.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ProtocolError;

/// Compiled defaults for every tunable.
pub mod defaults {
    /// Files at or under this byte size are batchable.
    pub const SMALL_FILE_THRESHOLD: u64 = 8 * 1024;
    /// Character budget per batch prompt.
    pub const MAX_BATCH_CHARS: usize = 30_000;
    /// File count cap per batch.
    pub const MAX_FILES_PER_BATCH: usize = 10;

    pub const MAX_GLOBAL_CONCURRENCY: usize = 16;
    pub const MAX_FILE_ANALYSIS_WORKERS: usize = 4;
    pub const MAX_RELATIONSHIP_WORKERS: usize = 4;

    /// LLM requests per minute.
    pub const API_RATE_LIMIT: u32 = 60;
    pub const LLM_TIMEOUT_SECS: u64 = 120;

    /// Confidence factor weights (sum to 1).
    pub const WEIGHT_SYNTAX: f64 = 0.3;
    pub const WEIGHT_SEMANTIC: f64 = 0.3;
    pub const WEIGHT_CONTEXT: f64 = 0.2;
    pub const WEIGHT_CROSS_REF: f64 = 0.2;

    /// Neutral factor score reported when no evidence of a kind exists.
    pub const NEUTRAL_FACTOR: f64 = 0.5;

    /// Penalty deltas, applied additively to the penalty factor.
    pub const PENALTY_DYNAMIC_IMPORT: f64 = -0.15;
    pub const PENALTY_INDIRECT_REF: f64 = -0.10;
    pub const PENALTY_CONFLICT: f64 = -0.20;
    pub const PENALTY_AMBIGUOUS: f64 = -0.05;

    pub const ESCALATION_THRESHOLD: f64 = 0.5;
    /// Uncertainty adjustment below this fires HIGH_UNCERTAINTY.
    pub const HIGH_UNCERTAINTY_THRESHOLD: f64 = 0.6;

    /// Consensus thresholds.
    pub const ACCEPT_THRESHOLD: f64 = 0.7;
    pub const REJECT_THRESHOLD: f64 = 0.3;
    /// Minimum agents that must report for a consensus.
    pub const MIN_QUORUM: usize = 3;
    pub const AGENT_TIMEOUT_MS: u64 = 30_000;

    /// Queue retry policy.
    pub const MAX_JOB_ATTEMPTS: i32 = 3;
    /// Base backoff in milliseconds (doubled per attempt).
    pub const RETRY_BACKOFF_BASE_MS: u64 = 500;
    pub const RETRY_BACKOFF_MAX_MS: u64 = 60_000;
    pub const RETRY_JITTER_MS: u64 = 250;
    /// Reserved jobs return to pending after this long without an ack.
    pub const VISIBILITY_TIMEOUT_MS: u64 = 30_000;
    /// Enqueues carrying the same dedup key within this window are dropped.
    pub const DEDUP_WINDOW_MS: u64 = 60_000;

    /// Circuit breaker: consecutive failures before the circuit opens.
    pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
    pub const CIRCUIT_COOLDOWN_MS: u64 = 10_000;
    /// Rolling-window thresholds for adaptive concurrency.
    pub const SCALE_UP_SUCCESS_RATE: f64 = 0.95;
    pub const SCALE_DOWN_FAILURE_RATE: f64 = 0.5;

    /// Shutdown budget per phase.
    pub const SHUTDOWN_PHASE_TIMEOUT_MS: u64 = 10_000;
    pub const SHUTDOWN_RETRY_ATTEMPTS: u32 = 2;
    /// Per-op cap during the force-shutdown fallback.
    pub const FORCE_SHUTDOWN_OP_TIMEOUT_MS: u64 = 1_000;
}

/// Conditions that route a scored candidate into triangulation even when
/// its confidence clears the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTrigger {
    LowConfidence,
    HighUncertainty,
    ConflictingEvidence,
}

impl EscalationTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationTrigger::LowConfidence => "LOW_CONFIDENCE",
            EscalationTrigger::HighUncertainty => "HIGH_UNCERTAINTY",
            EscalationTrigger::ConflictingEvidence => "CONFLICTING_EVIDENCE",
        }
    }
}

impl FromStr for EscalationTrigger {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "LOW_CONFIDENCE" => Ok(EscalationTrigger::LowConfidence),
            "HIGH_UNCERTAINTY" => Ok(EscalationTrigger::HighUncertainty),
            "CONFLICTING_EVIDENCE" => Ok(EscalationTrigger::ConflictingEvidence),
            other => Err(ProtocolError::UnknownVariant {
                kind: "escalation trigger",
                value: other.to_string(),
            }),
        }
    }
}

/// Factor weights for the confidence scorer. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub syntax: f64,
    pub semantic: f64,
    pub context: f64,
    pub cross_ref: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            syntax: defaults::WEIGHT_SYNTAX,
            semantic: defaults::WEIGHT_SEMANTIC,
            context: defaults::WEIGHT_CONTEXT,
            cross_ref: defaults::WEIGHT_CROSS_REF,
        }
    }
}

impl ScorerWeights {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let sum = self.syntax + self.semantic + self.context + self.cross_ref;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ProtocolError::InvalidConfig {
                key: "CONFIDENCE_WEIGHTS_*".to_string(),
                reason: format!("weights sum to {sum}, expected 1.0"),
            });
        }
        Ok(())
    }
}

/// Penalty deltas keyed by the evidence context flags that trigger them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenaltyWeights {
    pub dynamic_import: f64,
    pub indirect_ref: f64,
    pub conflict: f64,
    pub ambiguous: f64,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            dynamic_import: defaults::PENALTY_DYNAMIC_IMPORT,
            indirect_ref: defaults::PENALTY_INDIRECT_REF,
            conflict: defaults::PENALTY_CONFLICT,
            ambiguous: defaults::PENALTY_AMBIGUOUS,
        }
    }
}

/// Confidence scorer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub weights: ScorerWeights,
    pub penalties: PenaltyWeights,
    pub escalation_threshold: f64,
    pub high_uncertainty_threshold: f64,
    /// Enabled escalation triggers. Configurable: LOW_CONFIDENCE is never
    /// assumed to be the only one.
    pub triggers: Vec<EscalationTrigger>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: ScorerWeights::default(),
            penalties: PenaltyWeights::default(),
            escalation_threshold: defaults::ESCALATION_THRESHOLD,
            high_uncertainty_threshold: defaults::HIGH_UNCERTAINTY_THRESHOLD,
            triggers: vec![
                EscalationTrigger::LowConfidence,
                EscalationTrigger::HighUncertainty,
                EscalationTrigger::ConflictingEvidence,
            ],
        }
    }
}

/// Triangulation consensus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub accept_threshold: f64,
    pub reject_threshold: f64,
    pub min_quorum: usize,
    pub agent_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            accept_threshold: defaults::ACCEPT_THRESHOLD,
            reject_threshold: defaults::REJECT_THRESHOLD,
            min_quorum: defaults::MIN_QUORUM,
            agent_timeout_ms: defaults::AGENT_TIMEOUT_MS,
        }
    }
}

/// File batching policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPolicy {
    pub enabled: bool,
    pub small_file_threshold: u64,
    pub max_batch_chars: usize,
    pub max_files_per_batch: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            small_file_threshold: defaults::SMALL_FILE_THRESHOLD,
            max_batch_chars: defaults::MAX_BATCH_CHARS,
            max_files_per_batch: defaults::MAX_FILES_PER_BATCH,
        }
    }
}

/// Worker pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolLimits {
    pub max_global_concurrency: usize,
    pub max_file_analysis_workers: usize,
    pub max_relationship_workers: usize,
    pub adaptive_concurrency: bool,
    pub circuit_breaker_enabled: bool,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_global_concurrency: defaults::MAX_GLOBAL_CONCURRENCY,
            max_file_analysis_workers: defaults::MAX_FILE_ANALYSIS_WORKERS,
            max_relationship_workers: defaults::MAX_RELATIONSHIP_WORKERS,
            adaptive_concurrency: true,
            circuit_breaker_enabled: true,
        }
    }
}

/// LLM endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub rate_limit_per_min: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            timeout_secs: defaults::LLM_TIMEOUT_SECS,
            rate_limit_per_min: defaults::API_RATE_LIMIT,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Relational store URL (`sqlite:...`), empty means in-memory.
    pub db_url: String,
    pub llm: LlmSettings,
    pub batching: BatchPolicy,
    pub pools: PoolLimits,
    pub scorer: ScorerConfig,
    pub consensus: ConsensusConfig,
}

impl PipelineConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Fails fast (Fatal) on values that parse but are invalid, e.g.
    /// weights that do not sum to 1.
    pub fn from_env() -> Result<Self, ProtocolError> {
        let mut config = Self {
            db_url: env_string("CARTOGRAPH_DB").unwrap_or_default(),
            ..Self::default()
        };

        if let Some(endpoint) = env_string("LLM_ENDPOINT") {
            config.llm.endpoint = endpoint;
        }
        if let Some(key) = env_string("LLM_API_KEY") {
            config.llm.api_key = key;
        }
        if let Some(model) = env_string("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(v) = env_parse::<u32>("API_RATE_LIMIT")? {
            config.llm.rate_limit_per_min = v;
        }

        if let Some(v) = env_parse::<usize>("MAX_GLOBAL_CONCURRENCY")? {
            config.pools.max_global_concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_FILE_ANALYSIS_WORKERS")? {
            config.pools.max_file_analysis_workers = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_RELATIONSHIP_WORKERS")? {
            config.pools.max_relationship_workers = v;
        }
        if let Some(v) = env_parse::<bool>("ADAPTIVE_CONCURRENCY")? {
            config.pools.adaptive_concurrency = v;
        }
        if let Some(v) = env_parse::<bool>("CIRCUIT_BREAKER_ENABLED")? {
            config.pools.circuit_breaker_enabled = v;
        }

        if let Some(v) = env_parse::<bool>("FILE_BATCHING_ENABLED")? {
            config.batching.enabled = v;
        }
        if let Some(v) = env_parse::<usize>("BATCH_SIZE")? {
            config.batching.max_files_per_batch = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_BATCH_CHARS")? {
            config.batching.max_batch_chars = v;
        }
        if let Some(v) = env_parse::<u64>("SMALL_FILE_THRESHOLD")? {
            config.batching.small_file_threshold = v;
        }

        if let Some(v) = env_parse::<f64>("CONFIDENCE_WEIGHTS_SYNTAX")? {
            config.scorer.weights.syntax = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_WEIGHTS_SEMANTIC")? {
            config.scorer.weights.semantic = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_WEIGHTS_CONTEXT")? {
            config.scorer.weights.context = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_WEIGHTS_CROSS_REF")? {
            config.scorer.weights.cross_ref = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_THRESHOLDS_ESCALATION")? {
            config.scorer.escalation_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_THRESHOLDS_ACCEPT")? {
            config.consensus.accept_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("CONFIDENCE_THRESHOLDS_REJECT")? {
            config.consensus.reject_threshold = v;
        }

        if let Some(raw) = env_string("ESCALATION_TRIGGERS") {
            let mut triggers = Vec::new();
            for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                triggers.push(part.parse::<EscalationTrigger>()?);
            }
            config.scorer.triggers = triggers;
        }

        config.scorer.weights.validate()?;
        Ok(config)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ProtocolError>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            ProtocolError::InvalidConfig {
                key: key.to_string(),
                reason: e.to_string(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        ScorerWeights::default().validate().unwrap();
    }

    #[test]
    fn test_bad_weights_rejected() {
        let weights = ScorerWeights {
            syntax: 0.5,
            semantic: 0.5,
            context: 0.5,
            cross_ref: 0.5,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_trigger_parsing() {
        assert_eq!(
            "HIGH_UNCERTAINTY".parse::<EscalationTrigger>().unwrap(),
            EscalationTrigger::HighUncertainty
        );
        assert!("SOMETHING_ELSE".parse::<EscalationTrigger>().is_err());
    }

    #[test]
    fn test_default_triggers_are_plural() {
        // The trigger set must never collapse to LOW_CONFIDENCE alone.
        let config = ScorerConfig::default();
        assert!(config.triggers.len() > 1);
    }
}
