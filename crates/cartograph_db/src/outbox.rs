//! Transactional outbox storage.
//!
//! Producers append events in the same transaction that mutates business
//! rows; the publisher drains `new` rows in id order and marks them
//! `dispatched` only after the side effect (a queue enqueue) succeeded.
//! The publisher is single-writer per store, coordinated by a lease row
//! that expires on crash.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use cartograph_protocol::{OutboxEvent, OutboxEventType, OutboxStatus};

use crate::error::{DbError, Result};
use crate::pool::DbPool;

pub struct OutboxStore {
    pool: DbPool,
}

impl OutboxStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append an event within an existing transaction.
    ///
    /// This is the only write path for producers: it must share the
    /// transaction of the business mutation it describes.
    pub async fn append(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event_type: OutboxEventType,
        aggregate_id: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (event_type, aggregate_id, payload, status, created_at)
            VALUES (?, ?, ?, 'new', ?)
            RETURNING id
            "#,
        )
        .bind(event_type.as_str())
        .bind(aggregate_id)
        .bind(payload.to_string())
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Fetch the oldest `new` events, in id order.
    pub async fn fetch_new(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM outbox WHERE status = 'new' ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Mark an event dispatched. Called only after the target enqueue
    /// committed.
    pub async fn mark_dispatched(&self, id: i64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE outbox SET status = 'dispatched', processed_at = ? WHERE id = ? AND status = 'new'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an event failed, recording the error for diagnosis. Failed
    /// events are left for operator inspection, never silently retried
    /// forever.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE outbox SET status = 'failed', processed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count events by status: (new, dispatched, failed).
    pub async fn counts(&self) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'new') as new_count,
                COUNT(*) FILTER (WHERE status = 'dispatched') as dispatched_count,
                COUNT(*) FILTER (WHERE status = 'failed') as failed_count
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.try_get("new_count")?,
            row.try_get("dispatched_count")?,
            row.try_get("failed_count")?,
        ))
    }

    // ========================================================================
    // Publisher lease (single writer)
    // ========================================================================

    /// Try to acquire (or renew) the publisher lease.
    ///
    /// Succeeds when the lease is free, expired, or already held by this
    /// instance. Multiple publisher instances are safe: only the holder
    /// drains.
    pub async fn acquire_lease(&self, holder: &str, ttl_ms: u64) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires = now + ttl_ms as i64;
        let rows = sqlx::query(
            r#"
            UPDATE outbox_lease
            SET holder = ?, expires_at = ?
            WHERE id = 1 AND (holder IS NULL OR expires_at < ? OR holder = ?)
            "#,
        )
        .bind(holder)
        .bind(expires)
        .bind(now)
        .bind(holder)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            debug!(holder, "Outbox lease held");
        }
        Ok(rows > 0)
    }

    /// Release the lease if held by this instance.
    pub async fn release_lease(&self, holder: &str) -> Result<()> {
        sqlx::query("UPDATE outbox_lease SET holder = NULL, expires_at = 0 WHERE id = 1 AND holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxEvent> {
    let type_raw: String = row.try_get("event_type")?;
    let event_type: OutboxEventType = type_raw
        .parse()
        .map_err(|_| DbError::corrupt("outbox", format!("bad event_type '{type_raw}'")))?;
    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "new" => OutboxStatus::New,
        "dispatched" => OutboxStatus::Dispatched,
        "failed" => OutboxStatus::Failed,
        other => return Err(DbError::corrupt("outbox", format!("bad status '{other}'"))),
    };
    let payload_raw: String = row.try_get("payload")?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        event_type,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: serde_json::from_str(&payload_raw)?,
        created_at: millis_to_datetime(row.try_get("created_at")?),
        processed_at: row
            .try_get::<Option<i64>, _>("processed_at")?
            .map(millis_to_datetime),
        status,
    })
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}
