//! Database error type.

use cartograph_protocol::ErrorClass;
use thiserror::Error;

/// Errors from the relational store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl DbError {
    pub fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        DbError::CorruptRow {
            table,
            reason: reason.into(),
        }
    }

    /// Classify for retry decisions. Lock contention and pool timeouts are
    /// worth retrying; a corrupt row never is.
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Database(sqlx::Error::PoolTimedOut)
            | DbError::Database(sqlx::Error::PoolClosed) => ErrorClass::Transient,
            DbError::Database(e) => {
                if let Some(db_err) = e.as_database_error() {
                    // SQLITE_BUSY / SQLITE_LOCKED surface as database errors
                    let msg = db_err.message();
                    if msg.contains("locked") || msg.contains("busy") {
                        return ErrorClass::Store;
                    }
                }
                ErrorClass::Store
            }
            DbError::InvalidUrl(_) => ErrorClass::Fatal,
            DbError::CorruptRow { .. } => ErrorClass::Fatal,
            DbError::Serde(_) => ErrorClass::Validation,
            DbError::NotFound { .. } => ErrorClass::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
