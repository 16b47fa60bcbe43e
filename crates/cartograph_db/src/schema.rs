//! Database schema creation for all Cartograph tables.
//!
//! All CREATE TABLE statements live here - single source of truth. Schema
//! creation is idempotent and runs at every startup.

use crate::error::Result;
use crate::CartographDb;
use tracing::info;

impl CartographDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_entity_tables().await?;
        self.create_queue_tables().await?;
        self.create_outbox_tables().await?;

        info!("Database schema verified");
        Ok(())
    }

    /// Business tables: files, POIs, relationships, evidence, sessions.
    async fn create_entity_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                first_seen_at INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS pois (
                id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL REFERENCES files(path),
                name TEXT NOT NULL,
                poi_type TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                excerpt TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pois_file ON pois(file_path)")
            .execute(self.pool())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pois_name ON pois(name)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                source_poi_id TEXT NOT NULL REFERENCES pois(id),
                target_poi_id TEXT,
                target_name TEXT NOT NULL,
                resolution_hint TEXT,
                rel_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                reason TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                breakdown TEXT,
                created_at INTEGER NOT NULL,
                decided_at INTEGER
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_relationships_status ON relationships(status)",
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_poi_id)",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relationship_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                candidate_id TEXT NOT NULL REFERENCES relationships(id),
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                agent TEXT NOT NULL,
                confidence REAL NOT NULL,
                context TEXT NOT NULL DEFAULT '{}'
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_evidence_candidate ON relationship_evidence(candidate_id)",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS directory_summaries (
                path TEXT PRIMARY KEY,
                file_count INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                last_scanned_at INTEGER NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS triangulation_sessions (
                id TEXT PRIMARY KEY,
                candidate_id TEXT NOT NULL REFERENCES relationships(id),
                started_at INTEGER NOT NULL,
                phase TEXT NOT NULL DEFAULT 'queued',
                agent_results TEXT NOT NULL DEFAULT '[]',
                outcome TEXT,
                final_confidence REAL
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_candidate ON triangulation_sessions(candidate_id)",
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Durable job queue + dead-letter companion.
    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                dedup_key TEXT,
                last_error TEXT,
                worker_id TEXT,
                visible_at INTEGER NOT NULL DEFAULT 0,
                reserved_until INTEGER,
                enqueued_at INTEGER NOT NULL,
                completed_at INTEGER
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_queue_claim
             ON job_queue(queue, state, priority DESC, id ASC)",
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_queue_dedup ON job_queue(queue, dedup_key)",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_queue_dead (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_job_id INTEGER NOT NULL,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                reason TEXT NOT NULL,
                dead_at INTEGER NOT NULL
            )"#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Outbox + single-writer publisher lease.
    async fn create_outbox_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                created_at INTEGER NOT NULL,
                processed_at INTEGER,
                last_error TEXT
            )"#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS outbox_lease (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT,
                expires_at INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(self.pool())
        .await?;

        // Seed the single lease row
        sqlx::query("INSERT OR IGNORE INTO outbox_lease (id, holder, expires_at) VALUES (1, NULL, 0)")
            .execute(self.pool())
            .await?;

        Ok(())
    }
}
