//! SQLite pool creation.
//!
//! Concrete `SqlitePool` rather than `sqlx::AnyPool` so `#[derive(FromRow)]`
//! works with custom types.

use crate::error::{DbError, Result};
use tracing::info;

/// Database pool type alias.
pub type DbPool = sqlx::SqlitePool;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum connections in the pool.
    pub max_connections: u32,
}

impl DbConfig {
    /// On-disk SQLite database, created if missing.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// In-memory database (for testing). Single connection: a second
    /// connection would see a different empty database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    /// Parse a `sqlite:` URL, defaulting empty input to in-memory.
    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Ok(Self::memory());
        }
        if !url.starts_with("sqlite:") {
            return Err(DbError::InvalidUrl(url));
        }
        Ok(Self {
            url,
            max_connections: 5,
        })
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a pool and apply SQLite optimizations.
pub async fn create_pool(config: DbConfig) -> Result<DbPool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    // WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000")
        .execute(&pool)
        .await?;

    info!(url = %config.url, "Connected to database");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool() {
        let pool = create_pool(DbConfig::memory()).await;
        assert!(pool.is_ok());
    }

    #[test]
    fn test_from_url_rejects_non_sqlite() {
        assert!(DbConfig::from_url("postgres://localhost/x").is_err());
        assert!(DbConfig::from_url("sqlite:cartograph.db").is_ok());
        assert!(DbConfig::from_url("").is_ok());
    }
}
