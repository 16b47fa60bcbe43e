//! Pipeline error type.
//!
//! Wraps the library errors and carries the error class through to the
//! queue's nack path: a worker returning an error with a retriable class
//! gets the job redelivered with backoff, anything else dead-letters.

use cartograph_db::DbError;
use cartograph_graph::GraphError;
use cartograph_llm::LlmError;
use cartograph_protocol::{ErrorClass, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("shutdown already in progress")]
    ShutdownInProgress,

    #[error("{0}")]
    Invalid(String),
}

impl PipelineError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Db(e) => e.class(),
            PipelineError::Llm(e) => e.class(),
            PipelineError::Graph(_) => ErrorClass::Store,
            PipelineError::Protocol(e) => e.class(),
            PipelineError::Io { .. } => ErrorClass::Transient,
            PipelineError::Timeout(_) => ErrorClass::Transient,
            PipelineError::ShutdownInProgress => ErrorClass::Validation,
            PipelineError::Invalid(_) => ErrorClass::Validation,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
