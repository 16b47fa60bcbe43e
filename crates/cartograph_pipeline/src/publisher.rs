//! Outbox publisher.
//!
//! Drains `new` outbox rows in id order into the target queues. An event
//! is marked `dispatched` only after its enqueue committed, so a crash
//! between the two re-delivers (at-least-once); consumers are idempotent.
//! Single writer per store via the lease row; extra instances poll the
//! lease and stay passive.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cartograph_db::{CartographDb, EnqueueOpts};
use cartograph_protocol::OutboxEvent;

use crate::error::Result;

const POLL_BATCH: i64 = 64;
const LEASE_TTL_MS: u64 = 10_000;
const IDLE_BACKOFF_BASE_MS: u64 = 50;
const IDLE_BACKOFF_MAX_MS: u64 = 1_000;

pub struct OutboxPublisher {
    db: CartographDb,
    instance_id: String,
}

impl OutboxPublisher {
    pub fn new(db: CartographDb) -> Self {
        Self {
            db,
            instance_id: format!("pub-{}", &uuid::Uuid::new_v4().to_string()[..8]),
        }
    }

    /// Run until the stop signal flips. Returns the number of events
    /// dispatched over the publisher's lifetime.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) -> Result<u64> {
        let outbox = self.db.outbox();
        let mut dispatched_total = 0u64;
        let mut idle_backoff = IDLE_BACKOFF_BASE_MS;

        info!(instance = %self.instance_id, "Outbox publisher started");

        loop {
            if *stop_rx.borrow() {
                break;
            }

            if !outbox.acquire_lease(&self.instance_id, LEASE_TTL_MS).await? {
                // Another instance is draining
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(LEASE_TTL_MS / 2)) => {}
                }
                continue;
            }

            let dispatched = self.drain_once().await?;
            dispatched_total += dispatched;

            if dispatched == 0 {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(idle_backoff)) => {}
                }
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_MAX_MS);
            } else {
                idle_backoff = IDLE_BACKOFF_BASE_MS;
            }
        }

        outbox.release_lease(&self.instance_id).await?;
        info!(instance = %self.instance_id, dispatched_total, "Outbox publisher stopped");
        Ok(dispatched_total)
    }

    /// Drain one batch. Public for tests and for the runner's final sweep.
    pub async fn drain_once(&self) -> Result<u64> {
        let outbox = self.db.outbox();
        let queue = self.db.queue();
        let events = outbox.fetch_new(POLL_BATCH).await?;
        let mut dispatched = 0u64;

        for event in events {
            match self.dispatch(&queue, &event).await {
                Ok(()) => {
                    outbox.mark_dispatched(event.id).await?;
                    dispatched += 1;
                }
                Err(e) => {
                    // Leave the event `new`; the next pass retries. Never
                    // mark dispatched before the enqueue committed.
                    warn!(event_id = event.id, error = %e, "Dispatch failed, will retry");
                    break;
                }
            }
        }
        Ok(dispatched)
    }

    async fn dispatch(&self, queue: &cartograph_db::JobQueue, event: &OutboxEvent) -> Result<()> {
        match event.event_type.target_queue() {
            Some(target) => {
                queue
                    .enqueue(target, &event.payload, EnqueueOpts::default())
                    .await?;
                debug!(event_id = event.id, event_type = %event.event_type, target, "Dispatched");
            }
            None => {
                // Informational event: dispatching is the marking itself
                debug!(event_id = event.id, event_type = %event.event_type, "Recorded");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::OutboxStore;
    use cartograph_protocol::{queues, OutboxEventType};
    use serde_json::json;

    #[tokio::test]
    async fn test_drain_enqueues_and_marks() {
        let db = CartographDb::connect_memory().await.unwrap();

        let mut tx = db.pool().begin().await.unwrap();
        OutboxStore::append(
            &mut tx,
            OutboxEventType::RelationshipsRequested,
            "src/lib.rs",
            &json!({"file_path": "src/lib.rs"}),
        )
        .await
        .unwrap();
        OutboxStore::append(&mut tx, OutboxEventType::PoiCreated, "src/lib.rs", &json!({}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let publisher = OutboxPublisher::new(db.clone());
        let dispatched = publisher.drain_once().await.unwrap();
        assert_eq!(dispatched, 2);

        // Queue-routed event landed; informational event only marked
        let stats = db.queue().stats(queues::RELATIONSHIP_RESOLUTION).await.unwrap();
        assert_eq!(stats.pending, 1);

        let (new, dispatched, _) = db.outbox().counts().await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(dispatched, 2);
    }

    #[tokio::test]
    async fn test_second_instance_stays_passive() {
        let db = CartographDb::connect_memory().await.unwrap();
        let outbox = db.outbox();
        assert!(outbox.acquire_lease("other", 60_000).await.unwrap());

        let publisher = OutboxPublisher::new(db.clone());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { publisher.run(stop_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let dispatched = handle.await.unwrap().unwrap();
        assert_eq!(dispatched, 0);
    }
}
