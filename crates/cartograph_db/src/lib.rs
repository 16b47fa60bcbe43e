//! Relational store for the Cartograph pipeline.
//!
//! One SQLite database holds business rows (files, POIs, relationships,
//! evidence, sessions), the durable job queue and the outbox. Keeping them
//! in one store is what makes the outbox contract cheap: business writes
//! and event appends share a transaction.

pub mod error;
pub mod outbox;
pub mod pool;
pub mod queue;
pub mod schema;
pub mod store;

pub use error::DbError;
pub use outbox::OutboxStore;
pub use pool::{create_pool, DbConfig, DbPool};
pub use queue::{EnqueueOpts, JobQueue, QueueStats, RetryPolicy};
pub use store::PipelineStore;

use tracing::info;

/// Handle over the Cartograph database.
///
/// Cheap to clone; all sub-stores share the underlying pool.
#[derive(Clone)]
pub struct CartographDb {
    pool: DbPool,
}

impl CartographDb {
    /// Connect and ensure the schema exists.
    pub async fn connect(config: DbConfig) -> Result<Self, DbError> {
        let pool = create_pool(config).await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        info!("Database ready");
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn connect_memory() -> Result<Self, DbError> {
        Self::connect(DbConfig::memory()).await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.pool.clone())
    }

    pub fn outbox(&self) -> OutboxStore {
        OutboxStore::new(self.pool.clone())
    }

    pub fn store(&self) -> PipelineStore {
        PipelineStore::new(self.pool.clone())
    }
}
