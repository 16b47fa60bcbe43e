//! Protocol errors and the shared error taxonomy.
//!
//! Every failure in the pipeline is classified into one of five kinds; the
//! class decides how the owning worker reacts (retry, re-prompt, drop,
//! bounded retry, or fast-fail). Library crates expose a `class()` on their
//! error types; the queue's nack path keys retry eligibility off
//! `ErrorClass::is_retriable`.

use thiserror::Error;

/// Failure classification (kinds, not types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, rate limits, 5xx, connection resets. Retried with backoff.
    Transient,
    /// Malformed LLM output. One stricter re-prompt, then aggregate failure.
    Parse,
    /// Schema or invariant breach. Offending record dropped, pipeline continues.
    Validation,
    /// Unique violation, deadlock, busy database. Retried a small finite
    /// number of times with jitter.
    Store,
    /// Misconfiguration, missing credentials, corrupted outbox. Fast-fail.
    Fatal,
}

impl ErrorClass {
    /// Whether the queue should schedule another attempt for this class.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Store)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Parse => "parse",
            ErrorClass::Validation => "validation",
            ErrorClass::Store => "store",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Errors raised by protocol-level parsing and validation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid {queue} payload: {reason}")]
    Payload { queue: String, reason: String },

    #[error("confidence {0} outside [0,1]")]
    ConfidenceOutOfRange(f64),

    #[error("POI rejected: {reason}")]
    InvalidPoi { reason: String },

    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("invalid configuration {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

impl ProtocolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::UnknownVariant { .. }
            | ProtocolError::Payload { .. }
            | ProtocolError::ConfidenceOutOfRange(_)
            | ProtocolError::InvalidPoi { .. } => ErrorClass::Validation,
            ProtocolError::MissingConfig(_) | ProtocolError::InvalidConfig { .. } => {
                ErrorClass::Fatal
            }
        }
    }
}

/// Validate a confidence value is within [0,1].
pub fn check_confidence(value: f64) -> Result<f64, ProtocolError> {
    if (0.0..=1.0).contains(&value) && value.is_finite() {
        Ok(value)
    } else {
        Err(ProtocolError::ConfidenceOutOfRange(value))
    }
}
