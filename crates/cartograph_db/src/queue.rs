//! Durable named job queues.
//!
//! Atomic job claiming via UPDATE ... WHERE inside a transaction, the same
//! pattern for every queue in the pipeline. Reserved jobs carry a
//! visibility deadline; jobs abandoned past it return to pending. Retries
//! back off exponentially with deterministic sub-ns jitter, and jobs that
//! exhaust their attempts land in the dead-letter companion table.

use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use tracing::{debug, info, warn};

use cartograph_protocol::config::defaults;
use cartograph_protocol::{JobState, QueueJob};

use crate::error::{DbError, Result};
use crate::pool::DbPool;

/// Retry/backoff policy applied on nack.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: defaults::RETRY_BACKOFF_BASE_MS,
            max_ms: defaults::RETRY_BACKOFF_MAX_MS,
            jitter_ms: defaults::RETRY_JITTER_MS,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given (0-based) attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = self
            .base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_ms);
        exp + jitter(self.jitter_ms)
    }
}

/// Deterministic-enough jitter without a PRNG dependency.
fn jitter(cap_ms: u64) -> u64 {
    if cap_ms == 0 {
        return 0;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % cap_ms)
        .unwrap_or(0)
}

/// Options for enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub priority: i32,
    pub delay_ms: u64,
    pub dedup_key: Option<String>,
    /// Override the default max attempts for this job.
    pub max_attempts: Option<i32>,
}

/// Per-queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.active + self.completed + self.failed + self.dead
    }

    /// Work still in flight or waiting.
    pub fn open(&self) -> i64 {
        self.pending + self.active
    }
}

pub struct JobQueue {
    pool: DbPool,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Append a job. Returns the job id, or `None` when a live job with the
    /// same dedup key already exists in this queue within the dedup window.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        opts: EnqueueOpts,
    ) -> Result<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::to_string(payload)?;

        let mut tx = self.pool.begin().await?;

        if let Some(key) = &opts.dedup_key {
            let window_start = now - defaults::DEDUP_WINDOW_MS as i64;
            let existing: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM job_queue
                WHERE queue = ? AND dedup_key = ?
                  AND state IN ('pending', 'active')
                  AND enqueued_at >= ?
                LIMIT 1
                "#,
            )
            .bind(queue)
            .bind(key)
            .bind(window_start)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(dup_of) = existing {
                tx.commit().await?;
                debug!(queue, dedup_key = %key, dup_of, "Enqueue deduplicated");
                return Ok(None);
            }
        }

        let visible_at = now + opts.delay_ms as i64;
        let max_attempts = opts.max_attempts.unwrap_or(defaults::MAX_JOB_ATTEMPTS);
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_queue
                (queue, payload, state, priority, max_attempts, dedup_key, visible_at, enqueued_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(&payload)
        .bind(opts.priority)
        .bind(max_attempts)
        .bind(&opts.dedup_key)
        .bind(visible_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(queue, job_id = id, "Enqueued job");
        Ok(Some(id))
    }

    /// Atomically claim the next visible pending job.
    ///
    /// Highest priority band first, FIFO within a band. The claimed job is
    /// invisible to other workers until `visibility_ms` elapses.
    pub async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_ms: u64,
    ) -> Result<Option<QueueJob>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let job_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM job_queue
            WHERE queue = ? AND state = 'pending' AND visible_at <= ?
            ORDER BY priority DESC, id ASC
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let reserved_until = now + visibility_ms as i64;
        let rows_affected = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'active',
                worker_id = ?,
                reserved_until = ?,
                attempts = attempts + 1
            WHERE id = ? AND state = 'pending'
            "#,
        )
        .bind(worker_id)
        .bind(reserved_until)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by another worker between SELECT and UPDATE
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM job_queue WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        let job = row_to_job(&row)?;
        debug!(queue, job_id, worker_id, "Reserved job");
        Ok(Some(job))
    }

    /// Mark a job completed.
    pub async fn ack(&self, job_id: i64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'completed', completed_at = ?, reserved_until = NULL
            WHERE id = ? AND state = 'active'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Report a failed attempt.
    ///
    /// Retriable errors with attempts remaining are rescheduled with
    /// backoff. Non-retriable errors fail the job immediately; exhausted
    /// jobs move to the dead-letter table. Both paths keep a copy of the
    /// payload in `job_queue_dead`.
    pub async fn nack(&self, job: &QueueJob, error: &str, retriable: bool) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        if retriable && job.attempts < job.max_attempts {
            let backoff = self.retry.backoff_ms(job.attempts.max(0) as u32);
            info!(
                queue = %job.queue,
                job_id = job.id,
                attempt = job.attempts,
                backoff_ms = backoff,
                "Scheduling retry with exponential backoff"
            );
            sqlx::query(
                r#"
                UPDATE job_queue
                SET state = 'pending',
                    last_error = ?,
                    worker_id = NULL,
                    reserved_until = NULL,
                    visible_at = ?
                WHERE id = ? AND state = 'active'
                "#,
            )
            .bind(error)
            .bind(now + backoff as i64)
            .bind(job.id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let (state, reason) = if retriable {
            ("dead", "max-retries-exceeded")
        } else {
            ("failed", "permanent-error")
        };
        warn!(
            queue = %job.queue,
            job_id = job.id,
            attempts = job.attempts,
            reason,
            "Job moving to dead letter"
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE job_queue
            SET state = ?, last_error = ?, worker_id = NULL, reserved_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(state)
        .bind(error)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO job_queue_dead
                (original_job_id, queue, payload, attempts, last_error, reason, dead_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue)
        .bind(job.payload.to_string())
        .bind(job.attempts)
        .bind(error)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return reserved-but-abandoned jobs to pending.
    ///
    /// Called periodically; the expired attempt still counts.
    pub async fn requeue_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let count = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'pending', worker_id = NULL, reserved_until = NULL, visible_at = ?
            WHERE state = 'active' AND reserved_until IS NOT NULL AND reserved_until < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if count > 0 {
            warn!(count, "Returned expired reservations to pending");
        }
        Ok(count)
    }

    /// Number of pending jobs currently visible in a queue.
    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue WHERE queue = ? AND state = 'pending' AND visible_at <= ?",
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    /// Per-state counts for a queue.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') as pending,
                COUNT(*) FILTER (WHERE state = 'active') as active,
                COUNT(*) FILTER (WHERE state = 'completed') as completed,
                COUNT(*) FILTER (WHERE state = 'failed') as failed,
                COUNT(*) FILTER (WHERE state = 'dead') as dead
            FROM job_queue
            WHERE queue = ?
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            active: row.try_get("active")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            dead: row.try_get("dead")?,
        })
    }

    /// Total open (pending + active) jobs across all queues.
    pub async fn open_jobs(&self) -> Result<i64> {
        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue WHERE state IN ('pending', 'active')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(open)
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<QueueJob> {
    let state_raw: String = row.try_get("state")?;
    let state: JobState = state_raw
        .parse()
        .map_err(|_| DbError::corrupt("job_queue", format!("bad state '{state_raw}'")))?;
    let payload_raw: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_raw)?;

    Ok(QueueJob {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        priority: row.try_get("priority")?,
        state,
        last_error: row.try_get("last_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CartographDb;
    use serde_json::json;

    async fn queue() -> JobQueue {
        CartographDb::connect_memory().await.unwrap().queue()
    }

    #[tokio::test]
    async fn test_reserve_empty_queue() {
        let q = queue().await;
        let job = q.reserve("file-analysis", "w1", 30_000).await.unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let q = queue().await;
        q.enqueue("q", &json!({"n": 1}), EnqueueOpts::default())
            .await
            .unwrap();
        q.enqueue(
            "q",
            &json!({"n": 2}),
            EnqueueOpts {
                priority: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        q.enqueue("q", &json!({"n": 3}), EnqueueOpts::default())
            .await
            .unwrap();

        let first = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(first.payload["n"], 2);
        let second = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(second.payload["n"], 1);
        let third = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(third.payload["n"], 3);
    }

    #[tokio::test]
    async fn test_delay_hides_job() {
        let q = queue().await;
        q.enqueue(
            "q",
            &json!({}),
            EnqueueOpts {
                delay_ms: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(q.reserve("q", "w1", 30_000).await.unwrap().is_none());
        assert_eq!(q.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dedup_within_window() {
        let q = queue().await;
        let opts = EnqueueOpts {
            dedup_key: Some("file:src/lib.rs".to_string()),
            ..Default::default()
        };
        let first = q.enqueue("q", &json!({}), opts.clone()).await.unwrap();
        let second = q.enqueue("q", &json!({}), opts).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_ack_completes() {
        let q = queue().await;
        q.enqueue("q", &json!({}), EnqueueOpts::default())
            .await
            .unwrap();
        let job = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        q.ack(job.id).await.unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.open(), 0);
    }

    #[tokio::test]
    async fn test_nack_retries_then_dead_letters() {
        let q = queue().await;
        q.enqueue(
            "q",
            &json!({}),
            EnqueueOpts {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Attempt 1: retriable failure reschedules
        let job = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        q.nack(&job, "timeout", true).await.unwrap();
        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.pending, 1);

        // Make the retry visible now
        sqlx::query("UPDATE job_queue SET visible_at = 0")
            .execute(&q.pool)
            .await
            .unwrap();

        // Attempt 2: exhausts max_attempts, lands in dead letter
        let job = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        q.nack(&job, "timeout", true).await.unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.open(), 0);

        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue_dead")
            .fetch_one(&q.pool)
            .await
            .unwrap();
        assert_eq!(dead, 1);
    }

    #[tokio::test]
    async fn test_nack_permanent_fails_immediately() {
        let q = queue().await;
        q.enqueue("q", &json!({}), EnqueueOpts::default())
            .await
            .unwrap();
        let job = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        q.nack(&job, "bad payload", false).await.unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_visibility_timeout_returns_job() {
        let q = queue().await;
        q.enqueue("q", &json!({}), EnqueueOpts::default())
            .await
            .unwrap();
        // Reserve with an already-expired visibility window
        let job = q.reserve("q", "w1", 0).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);

        let returned = q.requeue_expired().await.unwrap();
        assert_eq!(returned, 1);

        let again = q.reserve("q", "w2", 30_000).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_stats_account_for_everything() {
        let q = queue().await;
        for _ in 0..4 {
            q.enqueue("q", &json!({}), EnqueueOpts::default())
                .await
                .unwrap();
        }
        let a = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        q.ack(a.id).await.unwrap();
        let b = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();
        q.nack(&b, "nope", false).await.unwrap();
        let _c = q.reserve("q", "w1", 30_000).await.unwrap().unwrap();

        let stats = q.stats("q").await.unwrap();
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_ms: 500,
            max_ms: 60_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff_ms(0), 500);
        assert_eq!(policy.backoff_ms(1), 1_000);
        assert_eq!(policy.backoff_ms(2), 2_000);
        assert_eq!(policy.backoff_ms(10), 60_000);
    }
}
