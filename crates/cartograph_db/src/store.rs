//! Entity stores: files, POIs, relationship candidates, evidence and
//! triangulation sessions.
//!
//! Every write that other stages react to appends its outbox event in the
//! same transaction - if the business write commits, the event is
//! eventually delivered.

use chrono::Utc;
use serde_json::json;
use sqlx::Row;
use tracing::{debug, info};

use cartograph_protocol::{
    AgentResult, CandidateId, CandidateStatus, ConfidenceBreakdown, ConsensusOutcome,
    EvidenceItem, EvidenceKind, FileRecord, FileStatus, OutboxEventType, Poi, PoiType,
    RelationshipCandidate, RelationshipType, SessionPhase, TriangulationSession,
};

use crate::error::{DbError, Result};
use crate::outbox::{millis_to_datetime, OutboxStore};
use crate::pool::DbPool;

/// Outcome of upserting a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    New,
    Changed,
    /// Same content hash and already analyzed; skip re-analysis.
    Unchanged,
}

/// Aggregate counts for the monitor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreCounts {
    pub files_total: i64,
    pub files_analyzed: i64,
    pub files_failed: i64,
    pub pois: i64,
    pub candidates_pending: i64,
    pub candidates_scored: i64,
    pub candidates_escalated: i64,
    pub candidates_accepted: i64,
    pub candidates_rejected: i64,
    pub candidates_deferred: i64,
    pub evidence: i64,
    pub sessions: i64,
}

pub struct PipelineStore {
    pool: DbPool,
}

impl PipelineStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Upsert a scanned file row.
    ///
    /// A file whose content hash is unchanged and whose last analysis
    /// succeeded is left alone; changed content resets it to `pending`.
    pub async fn upsert_scanned_file(
        &self,
        path: &str,
        content_hash: &str,
        size_bytes: i64,
    ) -> Result<ScanOutcome> {
        let now = Utc::now().timestamp_millis();
        let existing = sqlx::query("SELECT content_hash, status FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO files (path, content_hash, size_bytes, status, first_seen_at, last_updated_at)
                    VALUES (?, ?, ?, 'pending', ?, ?)
                    "#,
                )
                .bind(path)
                .bind(content_hash)
                .bind(size_bytes)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(ScanOutcome::New)
            }
            Some(row) => {
                let old_hash: String = row.try_get("content_hash")?;
                let status: String = row.try_get("status")?;
                if old_hash == content_hash && status == "analyzed" {
                    return Ok(ScanOutcome::Unchanged);
                }
                sqlx::query(
                    r#"
                    UPDATE files
                    SET content_hash = ?, size_bytes = ?, status = 'pending', last_updated_at = ?
                    WHERE path = ?
                    "#,
                )
                .bind(content_hash)
                .bind(size_bytes)
                .bind(now)
                .bind(path)
                .execute(&self.pool)
                .await?;
                Ok(ScanOutcome::Changed)
            }
        }
    }

    pub async fn file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    pub async fn files_with_status(&self, status: FileStatus) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM files WHERE status = ? ORDER BY path")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_file).collect()
    }

    /// Mark a set of files batched and append one `batch-ready` event per
    /// batch, all in one transaction.
    pub async fn record_batches(
        &self,
        batches: &[cartograph_protocol::FileBatch],
    ) -> Result<Vec<i64>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut event_ids = Vec::with_capacity(batches.len());

        for batch in batches {
            for entry in &batch.files {
                sqlx::query(
                    "UPDATE files SET status = 'batched', last_updated_at = ? WHERE path = ?",
                )
                .bind(now)
                .bind(&entry.path)
                .execute(&mut *tx)
                .await?;
            }
            let aggregate = batch
                .files
                .first()
                .map(|e| e.path.as_str())
                .unwrap_or("empty-batch");
            let id = OutboxStore::append(
                &mut tx,
                OutboxEventType::BatchReady,
                aggregate,
                &serde_json::to_value(cartograph_protocol::BatchJob {
                    batch: batch.clone(),
                })?,
            )
            .await?;
            event_ids.push(id);
        }

        tx.commit().await?;
        info!(batches = batches.len(), "Recorded batches");
        Ok(event_ids)
    }

    // ========================================================================
    // POIs (file analysis results)
    // ========================================================================

    /// Persist one file's analysis: file row to `analyzed`, POIs inserted
    /// idempotently, plus `poi-created` and `relationships-requested`
    /// events - a single transaction.
    pub async fn record_file_analysis(&self, file_path: &str, pois: &[Poi]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE files SET status = 'analyzed', last_updated_at = ? WHERE path = ?")
            .bind(now)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        for poi in pois {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO pois (id, file_path, name, poi_type, start_line, end_line, excerpt)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(poi.id.as_str())
            .bind(&poi.file_path)
            .bind(&poi.name)
            .bind(poi.poi_type.as_str())
            .bind(poi.start_line)
            .bind(poi.end_line)
            .bind(&poi.excerpt)
            .execute(&mut *tx)
            .await?;
        }

        OutboxStore::append(
            &mut tx,
            OutboxEventType::PoiCreated,
            file_path,
            &json!({ "file_path": file_path, "poi_count": pois.len() }),
        )
        .await?;
        OutboxStore::append(
            &mut tx,
            OutboxEventType::RelationshipsRequested,
            file_path,
            &serde_json::to_value(cartograph_protocol::RelationshipRequestJob {
                file_path: file_path.to_string(),
            })?,
        )
        .await?;

        tx.commit().await?;
        debug!(file_path, pois = pois.len(), "Recorded file analysis");
        Ok(())
    }

    /// Mark a file failed and record the diagnostic event, one transaction.
    pub async fn record_file_failure(&self, file_path: &str, diagnostic: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE files SET status = 'failed', last_updated_at = ? WHERE path = ?")
            .bind(now)
            .bind(file_path)
            .execute(&mut *tx)
            .await?;

        OutboxStore::append(
            &mut tx,
            OutboxEventType::FileFailed,
            file_path,
            &json!({ "file_path": file_path, "diagnostic": diagnostic }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn poi(&self, id: &cartograph_protocol::PoiId) -> Result<Option<Poi>> {
        let row = sqlx::query("SELECT * FROM pois WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_poi).transpose()
    }

    pub async fn pois_for_file(&self, file_path: &str) -> Result<Vec<Poi>> {
        let rows = sqlx::query("SELECT * FROM pois WHERE file_path = ? ORDER BY start_line")
            .bind(file_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_poi).collect()
    }

    /// Resolve a symbolic name to a POI, preferring the given file.
    pub async fn resolve_poi(&self, name: &str, prefer_file: &str) -> Result<Option<Poi>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM pois
            WHERE name = ?
            ORDER BY (file_path = ?) DESC, id ASC
            LIMIT 1
            "#,
        )
        .bind(name)
        .bind(prefer_file)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_poi).transpose()
    }

    // ========================================================================
    // Relationship candidates + evidence
    // ========================================================================

    /// Insert candidates with their evidence and one
    /// `candidate-ready-for-scoring` event each, in a single transaction.
    ///
    /// Re-inserting an existing candidate id is a no-op (stable ids make
    /// redelivered resolution jobs idempotent).
    pub async fn insert_candidates(
        &self,
        candidates: &[(RelationshipCandidate, Vec<EvidenceItem>)],
    ) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for (candidate, evidence) in candidates {
            let rows = sqlx::query(
                r#"
                INSERT OR IGNORE INTO relationships
                    (id, source_poi_id, target_poi_id, target_name, resolution_hint,
                     rel_type, file_path, reason, confidence, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                "#,
            )
            .bind(candidate.id.as_str())
            .bind(candidate.source_poi_id.as_str())
            .bind(candidate.target_poi_id.as_ref().map(|id| id.as_str()))
            .bind(&candidate.target_name)
            .bind(&candidate.resolution_hint)
            .bind(candidate.rel_type.as_str())
            .bind(&candidate.file_path)
            .bind(&candidate.reason)
            .bind(candidate.confidence)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows == 0 {
                continue; // redelivery
            }
            inserted += 1;

            for item in evidence {
                sqlx::query(
                    r#"
                    INSERT INTO relationship_evidence (candidate_id, kind, text, agent, confidence, context)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(candidate.id.as_str())
                .bind(item.kind.as_str())
                .bind(&item.text)
                .bind(&item.agent)
                .bind(item.confidence)
                .bind(serde_json::to_string(&item.context)?)
                .execute(&mut *tx)
                .await?;
            }

            OutboxStore::append(
                &mut tx,
                OutboxEventType::CandidateReadyForScoring,
                candidate.id.as_str(),
                &serde_json::to_value(cartograph_protocol::ScoringJob {
                    candidate_id: candidate.id.clone(),
                })?,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn candidate(&self, id: &CandidateId) -> Result<Option<RelationshipCandidate>> {
        let row = sqlx::query("SELECT * FROM relationships WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_candidate).transpose()
    }

    /// Evidence for a candidate, in insertion (id) order. The scorer's
    /// determinism contract depends on this ordering.
    pub async fn evidence_for(&self, id: &CandidateId) -> Result<Vec<EvidenceItem>> {
        let rows = sqlx::query(
            "SELECT * FROM relationship_evidence WHERE candidate_id = ? ORDER BY id ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_evidence).collect()
    }

    /// Append additional evidence (triangulation sub-agents do this).
    pub async fn append_evidence(&self, items: &[EvidenceItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO relationship_evidence (candidate_id, kind, text, agent, confidence, context)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.candidate_id.as_str())
            .bind(item.kind.as_str())
            .bind(&item.text)
            .bind(&item.agent)
            .bind(item.confidence)
            .bind(serde_json::to_string(&item.context)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record an accepting score: candidate -> `accepted` plus the
    /// `candidate-accepted` event feeding the graph builder.
    pub async fn record_acceptance(
        &self,
        id: &CandidateId,
        breakdown: &ConfidenceBreakdown,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE relationships
            SET confidence = ?, breakdown = ?, status = 'accepted', decided_at = ?
            WHERE id = ? AND status IN ('pending', 'scored')
            "#,
        )
        .bind(breakdown.final_confidence)
        .bind(serde_json::to_string(breakdown)?)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        OutboxStore::append(
            &mut tx,
            OutboxEventType::CandidateAccepted,
            id.as_str(),
            &serde_json::to_value(cartograph_protocol::GraphMergeJob {
                candidate_id: id.clone(),
            })?,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record an escalating score: candidate -> `escalated`, a queued
    /// triangulation session, and the `candidate-escalated` event.
    pub async fn record_escalation(
        &self,
        id: &CandidateId,
        breakdown: &ConfidenceBreakdown,
        session: &TriangulationSession,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE relationships
            SET confidence = ?, breakdown = ?, status = 'escalated'
            WHERE id = ? AND status IN ('pending', 'scored')
            "#,
        )
        .bind(breakdown.final_confidence)
        .bind(serde_json::to_string(breakdown)?)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO triangulation_sessions (id, candidate_id, started_at, phase)
            VALUES (?, ?, ?, 'queued')
            "#,
        )
        .bind(&session.id)
        .bind(session.candidate_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        OutboxStore::append(
            &mut tx,
            OutboxEventType::CandidateEscalated,
            id.as_str(),
            &serde_json::to_value(cartograph_protocol::TriangulationJob {
                candidate_id: id.clone(),
                session_id: session.id.clone(),
            })?,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Triangulation sessions
    // ========================================================================

    pub async fn session(&self, id: &str) -> Result<Option<TriangulationSession>> {
        let row = sqlx::query("SELECT * FROM triangulation_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn session_for_candidate(
        &self,
        candidate_id: &CandidateId,
    ) -> Result<Option<TriangulationSession>> {
        let row = sqlx::query(
            "SELECT * FROM triangulation_sessions WHERE candidate_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(candidate_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn update_session_phase(&self, id: &str, phase: SessionPhase) -> Result<()> {
        sqlx::query("UPDATE triangulation_sessions SET phase = ? WHERE id = ?")
            .bind(phase.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the consensus decision: session completed, candidate moved to
    /// its terminal state, and (for acceptance) the graph-merge event - one
    /// transaction.
    pub async fn record_consensus(
        &self,
        session_id: &str,
        candidate_id: &CandidateId,
        outcome: ConsensusOutcome,
        final_confidence: f64,
        agent_results: &[AgentResult],
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let status = match outcome {
            ConsensusOutcome::Accepted => CandidateStatus::Accepted,
            ConsensusOutcome::Rejected => CandidateStatus::Rejected,
            ConsensusOutcome::Deferred => CandidateStatus::Deferred,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE triangulation_sessions
            SET phase = 'completed', outcome = ?, final_confidence = ?, agent_results = ?
            WHERE id = ?
            "#,
        )
        .bind(outcome.as_str())
        .bind(final_confidence)
        .bind(serde_json::to_string(agent_results)?)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE relationships
            SET status = ?, confidence = ?, decided_at = ?
            WHERE id = ? AND status = 'escalated'
            "#,
        )
        .bind(status.as_str())
        .bind(final_confidence)
        .bind(now)
        .bind(candidate_id.as_str())
        .execute(&mut *tx)
        .await?;

        if outcome == ConsensusOutcome::Accepted {
            OutboxStore::append(
                &mut tx,
                OutboxEventType::CandidateAccepted,
                candidate_id.as_str(),
                &serde_json::to_value(cartograph_protocol::GraphMergeJob {
                    candidate_id: candidate_id.clone(),
                })?,
            )
            .await?;
        }

        tx.commit().await?;
        info!(session_id, candidate_id = %candidate_id, outcome = %outcome, "Consensus recorded");
        Ok(())
    }

    // ========================================================================
    // Directory summaries & counts
    // ========================================================================

    pub async fn upsert_directory_summary(
        &self,
        path: &str,
        file_count: i64,
        total_bytes: i64,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO directory_summaries (path, file_count, total_bytes, last_scanned_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                file_count = excluded.file_count,
                total_bytes = excluded.total_bytes,
                last_scanned_at = excluded.last_scanned_at
            "#,
        )
        .bind(path)
        .bind(file_count)
        .bind(total_bytes)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        let files = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COUNT(*) FILTER (WHERE status = 'analyzed') as analyzed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM files
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pois: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pois")
            .fetch_one(&self.pool)
            .await?;

        let cands = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'scored') as scored,
                COUNT(*) FILTER (WHERE status = 'escalated') as escalated,
                COUNT(*) FILTER (WHERE status = 'accepted') as accepted,
                COUNT(*) FILTER (WHERE status = 'rejected') as rejected,
                COUNT(*) FILTER (WHERE status = 'deferred') as deferred
            FROM relationships
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let evidence: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relationship_evidence")
            .fetch_one(&self.pool)
            .await?;
        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM triangulation_sessions")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreCounts {
            files_total: files.try_get("total")?,
            files_analyzed: files.try_get("analyzed")?,
            files_failed: files.try_get("failed")?,
            pois,
            candidates_pending: cands.try_get("pending")?,
            candidates_scored: cands.try_get("scored")?,
            candidates_escalated: cands.try_get("escalated")?,
            candidates_accepted: cands.try_get("accepted")?,
            candidates_rejected: cands.try_get("rejected")?,
            candidates_deferred: cands.try_get("deferred")?,
            evidence,
            sessions,
        })
    }
}

// ============================================================================
// Row conversions
// ============================================================================

fn row_to_file(row: &sqlx::sqlite::SqliteRow) -> Result<FileRecord> {
    let status_raw: String = row.try_get("status")?;
    let status: FileStatus = status_raw
        .parse()
        .map_err(|_| DbError::corrupt("files", format!("bad status '{status_raw}'")))?;
    Ok(FileRecord {
        path: row.try_get("path")?,
        content_hash: row.try_get("content_hash")?,
        size_bytes: row.try_get("size_bytes")?,
        status,
        first_seen_at: millis_to_datetime(row.try_get("first_seen_at")?),
        last_updated_at: millis_to_datetime(row.try_get("last_updated_at")?),
    })
}

fn row_to_poi(row: &sqlx::sqlite::SqliteRow) -> Result<Poi> {
    let type_raw: String = row.try_get("poi_type")?;
    let poi_type: PoiType = type_raw
        .parse()
        .map_err(|_| DbError::corrupt("pois", format!("bad poi_type '{type_raw}'")))?;
    Ok(Poi {
        id: cartograph_protocol::PoiId::from_hash(row.try_get("id")?),
        file_path: row.try_get("file_path")?,
        name: row.try_get("name")?,
        poi_type,
        start_line: row.try_get::<i64, _>("start_line")? as u32,
        end_line: row.try_get::<i64, _>("end_line")? as u32,
        excerpt: row.try_get("excerpt")?,
    })
}

fn row_to_candidate(row: &sqlx::sqlite::SqliteRow) -> Result<RelationshipCandidate> {
    let status_raw: String = row.try_get("status")?;
    let status: CandidateStatus = status_raw
        .parse()
        .map_err(|_| DbError::corrupt("relationships", format!("bad status '{status_raw}'")))?;
    let type_raw: String = row.try_get("rel_type")?;
    let rel_type: RelationshipType = type_raw
        .parse()
        .map_err(|_| DbError::corrupt("relationships", format!("bad rel_type '{type_raw}'")))?;
    Ok(RelationshipCandidate {
        id: CandidateId::from_hash(row.try_get("id")?),
        source_poi_id: cartograph_protocol::PoiId::from_hash(row.try_get("source_poi_id")?),
        target_poi_id: row
            .try_get::<Option<String>, _>("target_poi_id")?
            .map(cartograph_protocol::PoiId::from_hash),
        target_name: row.try_get("target_name")?,
        resolution_hint: row.try_get("resolution_hint")?,
        rel_type,
        file_path: row.try_get("file_path")?,
        reason: row.try_get("reason")?,
        confidence: row.try_get("confidence")?,
        status,
    })
}

fn row_to_evidence(row: &sqlx::sqlite::SqliteRow) -> Result<EvidenceItem> {
    let kind_raw: String = row.try_get("kind")?;
    let kind: EvidenceKind = kind_raw
        .parse()
        .map_err(|_| DbError::corrupt("relationship_evidence", format!("bad kind '{kind_raw}'")))?;
    let context_raw: String = row.try_get("context")?;
    Ok(EvidenceItem {
        id: row.try_get("id")?,
        candidate_id: CandidateId::from_hash(row.try_get("candidate_id")?),
        kind,
        text: row.try_get("text")?,
        agent: row.try_get("agent")?,
        confidence: row.try_get("confidence")?,
        context: serde_json::from_str(&context_raw)?,
    })
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<TriangulationSession> {
    let phase_raw: String = row.try_get("phase")?;
    let phase = match phase_raw.as_str() {
        "queued" => SessionPhase::Queued,
        "dispatched" => SessionPhase::Dispatched,
        "awaiting-agents" => SessionPhase::AwaitingAgents,
        "consensus" => SessionPhase::Consensus,
        "completed" => SessionPhase::Completed,
        other => {
            return Err(DbError::corrupt(
                "triangulation_sessions",
                format!("bad phase '{other}'"),
            ))
        }
    };
    let outcome = match row.try_get::<Option<String>, _>("outcome")? {
        None => None,
        Some(raw) => Some(match raw.as_str() {
            "accepted" => ConsensusOutcome::Accepted,
            "rejected" => ConsensusOutcome::Rejected,
            "deferred" => ConsensusOutcome::Deferred,
            other => {
                return Err(DbError::corrupt(
                    "triangulation_sessions",
                    format!("bad outcome '{other}'"),
                ))
            }
        }),
    };
    let results_raw: String = row.try_get("agent_results")?;

    Ok(TriangulationSession {
        id: row.try_get("id")?,
        candidate_id: CandidateId::from_hash(row.try_get("candidate_id")?),
        started_at: millis_to_datetime(row.try_get("started_at")?),
        phase,
        agent_results: serde_json::from_str(&results_raw)?,
        outcome,
        final_confidence: row.try_get("final_confidence")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CartographDb;
    use cartograph_protocol::{candidate_id, poi_id};

    fn sample_poi(file: &str, name: &str) -> Poi {
        Poi {
            id: poi_id(file, name, "function", 1, 10),
            file_path: file.to_string(),
            name: name.to_string(),
            poi_type: PoiType::Function,
            start_line: 1,
            end_line: 10,
            excerpt: None,
        }
    }

    fn sample_candidate(source: &Poi, target_name: &str) -> RelationshipCandidate {
        RelationshipCandidate {
            id: candidate_id(&source.id, target_name, "CALLS", &source.file_path),
            source_poi_id: source.id.clone(),
            target_poi_id: None,
            target_name: target_name.to_string(),
            resolution_hint: None,
            rel_type: RelationshipType::Calls,
            file_path: source.file_path.clone(),
            reason: "direct invocation".to_string(),
            confidence: 0.0,
            status: CandidateStatus::Pending,
        }
    }

    fn sample_evidence(candidate: &RelationshipCandidate) -> EvidenceItem {
        EvidenceItem {
            id: 0,
            candidate_id: candidate.id.clone(),
            kind: EvidenceKind::LlmReasoning,
            text: "call expression observed".to_string(),
            agent: "llm".to_string(),
            confidence: 0.8,
            context: Default::default(),
        }
    }

    async fn seeded_db() -> (CartographDb, Poi) {
        let db = CartographDb::connect_memory().await.unwrap();
        let store = db.store();
        store
            .upsert_scanned_file("src/lib.rs", "hash-1", 100)
            .await
            .unwrap();
        let poi = sample_poi("src/lib.rs", "connect");
        store
            .record_file_analysis("src/lib.rs", std::slice::from_ref(&poi))
            .await
            .unwrap();
        (db, poi)
    }

    #[tokio::test]
    async fn test_scan_upsert_outcomes() {
        let db = CartographDb::connect_memory().await.unwrap();
        let store = db.store();

        assert_eq!(
            store.upsert_scanned_file("a.rs", "h1", 10).await.unwrap(),
            ScanOutcome::New
        );
        // Same hash but never analyzed: treated as changed (needs work)
        assert_eq!(
            store.upsert_scanned_file("a.rs", "h1", 10).await.unwrap(),
            ScanOutcome::Changed
        );

        store.record_file_analysis("a.rs", &[]).await.unwrap();
        assert_eq!(
            store.upsert_scanned_file("a.rs", "h1", 10).await.unwrap(),
            ScanOutcome::Unchanged
        );
        assert_eq!(
            store.upsert_scanned_file("a.rs", "h2", 12).await.unwrap(),
            ScanOutcome::Changed
        );
    }

    #[tokio::test]
    async fn test_file_analysis_emits_events() {
        let (db, _poi) = seeded_db().await;

        let file = db.store().file("src/lib.rs").await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Analyzed);

        let events = db.outbox().fetch_new(10).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&OutboxEventType::PoiCreated));
        assert!(types.contains(&OutboxEventType::RelationshipsRequested));
    }

    #[tokio::test]
    async fn test_poi_insert_is_idempotent() {
        let (db, poi) = seeded_db().await;
        // Redelivered analysis job writes the same POIs again
        db.store()
            .record_file_analysis("src/lib.rs", std::slice::from_ref(&poi))
            .await
            .unwrap();
        let pois = db.store().pois_for_file("src/lib.rs").await.unwrap();
        assert_eq!(pois.len(), 1);
    }

    #[tokio::test]
    async fn test_candidate_roundtrip_with_evidence() {
        let (db, poi) = seeded_db().await;
        let store = db.store();

        let candidate = sample_candidate(&poi, "Pool::new");
        let evidence = sample_evidence(&candidate);
        let inserted = store
            .insert_candidates(&[(candidate.clone(), vec![evidence])])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        // Redelivery is a no-op
        let again = store
            .insert_candidates(&[(candidate.clone(), vec![sample_evidence(&candidate)])])
            .await
            .unwrap();
        assert_eq!(again, 0);

        let loaded = store.candidate(&candidate.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CandidateStatus::Pending);
        assert_eq!(loaded.target_name, "Pool::new");

        let evidence = store.evidence_for(&candidate.id).await.unwrap();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::LlmReasoning);
    }

    #[tokio::test]
    async fn test_consensus_transitions_candidate() {
        let (db, poi) = seeded_db().await;
        let store = db.store();

        let candidate = sample_candidate(&poi, "Pool::new");
        store
            .insert_candidates(&[(candidate.clone(), vec![sample_evidence(&candidate)])])
            .await
            .unwrap();

        let breakdown = ConfidenceBreakdown {
            factors: cartograph_protocol::FactorScores {
                syntax: 0.5,
                semantic: 0.3,
                context: 0.5,
                cross_ref: 0.5,
            },
            weighted_sum: 0.3,
            penalty_factor: 1.0,
            uncertainty_adjustment: 0.7,
            raw_score: 0.3,
            final_confidence: 0.21,
            level: cartograph_protocol::ConfidenceLevel::VeryLow,
            escalation_needed: true,
            fired_triggers: vec!["LOW_CONFIDENCE".to_string()],
        };
        let session = TriangulationSession {
            id: "sess-1".to_string(),
            candidate_id: candidate.id.clone(),
            started_at: Utc::now(),
            phase: SessionPhase::Queued,
            agent_results: vec![],
            outcome: None,
            final_confidence: None,
        };
        store
            .record_escalation(&candidate.id, &breakdown, &session)
            .await
            .unwrap();

        let loaded = store.candidate(&candidate.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CandidateStatus::Escalated);

        store
            .record_consensus(
                "sess-1",
                &candidate.id,
                ConsensusOutcome::Deferred,
                0.47,
                &[],
            )
            .await
            .unwrap();

        let loaded = store.candidate(&candidate.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CandidateStatus::Deferred);
        let session = store.session("sess-1").await.unwrap().unwrap();
        assert_eq!(session.phase, SessionPhase::Completed);
        assert_eq!(session.outcome, Some(ConsensusOutcome::Deferred));
    }
}
