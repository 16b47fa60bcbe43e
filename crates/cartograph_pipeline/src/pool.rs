//! Worker pool manager.
//!
//! One bounded pool per job kind, all fed from the durable queue. Each
//! pool adapts its concurrency to the observed success rate and guards its
//! handler with a circuit breaker: consecutive failures open the circuit,
//! a cooldown later one probe job decides whether it closes again.
//! Scale-ups stop when the upstream queue is empty, so backpressure falls
//! out of queue depth rather than explicit signalling.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cartograph_db::JobQueue;
use cartograph_protocol::config::defaults;
use cartograph_protocol::{PoolLimits, QueueJob};

use crate::error::{PipelineError, Result};

/// Handler for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> Result<()>;
}

/// Per-pool tuning.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub visibility_ms: u64,
    /// Control tick for adaptive concurrency.
    pub tick_ms: u64,
    /// Base sleep when the queue is empty (doubles up to a cap).
    pub idle_backoff_ms: u64,
    /// Rolling outcome window size.
    pub window: usize,
    /// Failure rate over the window that halves concurrency.
    pub failure_threshold: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            visibility_ms: defaults::VISIBILITY_TIMEOUT_MS,
            tick_ms: 500,
            idle_backoff_ms: 50,
            window: 20,
            failure_threshold: defaults::SCALE_DOWN_FAILURE_RATE,
            breaker_threshold: defaults::CIRCUIT_BREAKER_THRESHOLD,
            breaker_cooldown_ms: defaults::CIRCUIT_COOLDOWN_MS,
        }
    }
}

impl PoolPolicy {
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable pool status.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub kind: String,
    pub target_concurrency: usize,
    pub inflight: usize,
    pub circuit: CircuitState,
    pub recent_failure_rate: f64,
}

struct PoolState {
    target: usize,
    inflight: usize,
    outcomes: VecDeque<bool>,
    consecutive_failures: u32,
    circuit: CircuitState,
    opened_at: Option<Instant>,
    probing: bool,
    last_tick: Instant,
}

impl PoolState {
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn success_rate(&self) -> f64 {
        1.0 - self.failure_rate()
    }

    fn record(&mut self, ok: bool, window: usize) {
        self.outcomes.push_back(ok);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}

struct Pool {
    kind: String,
    handler: Arc<dyn JobHandler>,
    policy: PoolPolicy,
    state: Mutex<PoolState>,
}

impl Pool {
    fn status(&self) -> PoolStatus {
        let state = self.state.lock().expect("pool state poisoned");
        PoolStatus {
            kind: self.kind.clone(),
            target_concurrency: state.target,
            inflight: state.inflight,
            circuit: state.circuit,
            recent_failure_rate: state.failure_rate(),
        }
    }
}

/// Spawns and supervises the per-kind pools.
pub struct WorkerPoolManager {
    queue: JobQueue,
    limits: PoolLimits,
    pools: Mutex<Vec<Arc<Pool>>>,
    global: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    worker_id: String,
}

impl WorkerPoolManager {
    pub fn new(queue: JobQueue, limits: PoolLimits) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            queue,
            global: Arc::new(Semaphore::new(limits.max_global_concurrency)),
            limits,
            pools: Mutex::new(Vec::new()),
            stop_tx,
            supervisors: Mutex::new(Vec::new()),
            worker_id: format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]),
        }
    }

    /// Register a pool for a job kind. Must be called before `start`.
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn JobHandler>, policy: PoolPolicy) {
        let kind = kind.into();
        let target = policy.min_workers.max(1);
        self.pools
            .lock()
            .expect("pools poisoned")
            .push(Arc::new(Pool {
                kind,
                handler,
                policy,
                state: Mutex::new(PoolState {
                    target,
                    inflight: 0,
                    outcomes: VecDeque::new(),
                    consecutive_failures: 0,
                    circuit: CircuitState::Closed,
                    opened_at: None,
                    probing: false,
                    last_tick: Instant::now(),
                }),
            }));
    }

    /// Start one supervisor task per registered pool plus the visibility
    /// maintenance loop.
    pub fn start(self: Arc<Self>) {
        let pools = self.pools.lock().expect("pools poisoned").clone();
        let mut supervisors = self.supervisors.lock().expect("supervisors poisoned");

        for pool in pools {
            let manager = Arc::clone(&self);
            let stop_rx = self.stop_tx.subscribe();
            supervisors.push(tokio::spawn(async move {
                manager.supervise(pool, stop_rx).await;
            }));
        }

        // Visibility maintenance: abandoned reservations back to pending
        let manager = Arc::clone(&self);
        let mut stop_rx = self.stop_tx.subscribe();
        supervisors.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Err(e) = manager.queue.requeue_expired().await {
                            warn!(error = %e, "Visibility maintenance failed");
                        }
                    }
                }
            }
        }));

        info!(worker_id = %self.worker_id, "Worker pools started");
    }

    async fn supervise(self: Arc<Self>, pool: Arc<Pool>, stop_rx: watch::Receiver<bool>) {
        let mut idle_backoff = pool.policy.idle_backoff_ms;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            // Circuit maintenance and admission control
            let admit = {
                let mut state = pool.state.lock().expect("pool state poisoned");
                if state.circuit == CircuitState::Open {
                    let cooled = state
                        .opened_at
                        .map(|t| t.elapsed() >= Duration::from_millis(pool.policy.breaker_cooldown_ms))
                        .unwrap_or(true);
                    if cooled {
                        state.circuit = CircuitState::HalfOpen;
                        info!(kind = %pool.kind, "Circuit half-open, admitting probe");
                    }
                }
                match state.circuit {
                    CircuitState::Open => Admission::Wait(pool.policy.breaker_cooldown_ms / 4),
                    CircuitState::HalfOpen if state.probing || state.inflight > 0 => {
                        Admission::Wait(50)
                    }
                    _ if state.inflight >= state.target => Admission::Wait(20),
                    _ => Admission::Admit,
                }
            };

            if let Admission::Wait(ms) = admit {
                tokio::time::sleep(Duration::from_millis(ms.max(1))).await;
                continue;
            }

            self.adaptive_tick(&pool).await;

            // Global concurrency cap
            let Ok(permit) = Arc::clone(&self.global).try_acquire_owned() else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            };

            let job = match self
                .queue
                .reserve(&pool.kind, &self.worker_id, pool.policy.visibility_ms)
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(idle_backoff)).await;
                    idle_backoff = (idle_backoff * 2).min(1_000);
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(kind = %pool.kind, error = %e, "Reserve failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };
            idle_backoff = pool.policy.idle_backoff_ms;

            {
                let mut state = pool.state.lock().expect("pool state poisoned");
                state.inflight += 1;
                if state.circuit == CircuitState::HalfOpen {
                    state.probing = true;
                }
            }

            let manager = Arc::clone(&self);
            let pool_ref = Arc::clone(&pool);
            tokio::spawn(async move {
                let _permit = permit;
                manager.run_job(&pool_ref, job).await;
            });
        }

        debug!(kind = %pool.kind, "Pool supervisor stopped");
    }

    async fn run_job(&self, pool: &Pool, job: QueueJob) {
        let outcome = pool.handler.handle(&job).await;
        let ok = outcome.is_ok();

        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.ack(job.id).await {
                    warn!(job_id = job.id, error = %e, "Ack failed");
                }
            }
            Err(e) => {
                error!(kind = %pool.kind, job_id = job.id, error = %e, "Job failed");
                if let Err(nack_err) = self
                    .queue
                    .nack(&job, &e.to_string(), e.is_retriable())
                    .await
                {
                    warn!(job_id = job.id, error = %nack_err, "Nack failed");
                }
            }
        }

        let mut state = pool.state.lock().expect("pool state poisoned");
        state.inflight = state.inflight.saturating_sub(1);
        state.record(ok, pool.policy.window);

        match state.circuit {
            CircuitState::HalfOpen => {
                state.probing = false;
                if ok {
                    state.circuit = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    info!(kind = %pool.kind, "Circuit closed after successful probe");
                } else {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(kind = %pool.kind, "Probe failed, circuit re-opened");
                }
            }
            CircuitState::Closed => {
                if self.limits.circuit_breaker_enabled
                    && state.consecutive_failures >= pool.policy.breaker_threshold
                {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        kind = %pool.kind,
                        consecutive_failures = state.consecutive_failures,
                        "Circuit breaker tripped"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Raise concurrency on sustained success with work waiting, halve it
    /// on a failure burst.
    async fn adaptive_tick(&self, pool: &Pool) {
        if !self.limits.adaptive_concurrency {
            return;
        }
        let due = {
            let state = pool.state.lock().expect("pool state poisoned");
            state.last_tick.elapsed() >= Duration::from_millis(pool.policy.tick_ms)
        };
        if !due {
            return;
        }

        let depth = self.queue.depth(&pool.kind).await.unwrap_or(0);
        let mut state = pool.state.lock().expect("pool state poisoned");
        state.last_tick = Instant::now();
        if state.outcomes.len() < 5 {
            return;
        }

        if state.failure_rate() > pool.policy.failure_threshold {
            let halved = (state.target / 2).max(pool.policy.min_workers);
            if halved < state.target {
                info!(kind = %pool.kind, from = state.target, to = halved, "Halving concurrency");
                state.target = halved;
            }
        } else if state.success_rate() > defaults::SCALE_UP_SUCCESS_RATE
            && depth > 0
            && state.target < pool.policy.max_workers
        {
            state.target += 1;
            debug!(kind = %pool.kind, target = state.target, "Raised concurrency");
        }
    }

    /// Pool statuses, for the monitor.
    pub fn status(&self) -> Vec<PoolStatus> {
        self.pools
            .lock()
            .expect("pools poisoned")
            .iter()
            .map(|p| p.status())
            .collect()
    }

    fn total_inflight(&self) -> usize {
        self.pools
            .lock()
            .expect("pools poisoned")
            .iter()
            .map(|p| p.state.lock().expect("pool state poisoned").inflight)
            .sum()
    }

    /// Stop reserving, let in-flight jobs finish, bounded by `timeout`.
    ///
    /// Jobs still running at the deadline stay reserved; the visibility
    /// timeout returns them to pending for the next run.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let _ = self.stop_tx.send(true);
        let deadline = Instant::now() + timeout;

        while self.total_inflight() > 0 {
            if Instant::now() >= deadline {
                let abandoned = self.total_inflight();
                warn!(abandoned, "Pool shutdown timed out; jobs return via visibility timeout");
                return Err(PipelineError::Timeout(format!(
                    "{abandoned} jobs still in flight"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for handle in self.supervisors.lock().expect("supervisors poisoned").drain(..) {
            handle.abort();
        }
        info!("Worker pools stopped");
        Ok(())
    }
}

enum Admission {
    Admit,
    Wait(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_db::{CartographDb, EnqueueOpts};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        handled: AtomicUsize,
        fail_first: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &QueueJob) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(PipelineError::Timeout("simulated".to_string()));
            }
            Ok(())
        }
    }

    async fn manager_with(db: &CartographDb, handler: Arc<CountingHandler>) -> Arc<WorkerPoolManager> {
        let manager = Arc::new(WorkerPoolManager::new(db.queue(), PoolLimits::default()));
        manager.register(
            "test-queue",
            handler,
            PoolPolicy {
                idle_backoff_ms: 5,
                ..Default::default()
            },
        );
        manager
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let db = CartographDb::connect_memory().await.unwrap();
        let queue = db.queue();
        for i in 0..5 {
            queue
                .enqueue("test-queue", &json!({ "n": i }), EnqueueOpts::default())
                .await
                .unwrap();
        }

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        });
        let manager = manager_with(&db, Arc::clone(&handler)).await;
        Arc::clone(&manager).start();

        for _ in 0..100 {
            if queue.stats("test-queue").await.unwrap().completed == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.shutdown(Duration::from_secs(2)).await.unwrap();

        let stats = queue.stats("test-queue").await.unwrap();
        assert_eq!(stats.completed, 5);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_to_success() {
        let db = CartographDb::connect_memory().await.unwrap();
        let queue = db.queue();
        queue
            .enqueue("test-queue", &json!({}), EnqueueOpts::default())
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(1),
        });
        let manager = manager_with(&db, Arc::clone(&handler)).await;
        Arc::clone(&manager).start();

        // First attempt fails (retriable), backoff reschedules, second succeeds
        for _ in 0..300 {
            if queue.stats("test-queue").await.unwrap().completed == 1 {
                break;
            }
            // Collapse the retry backoff so the test stays fast
            sqlx::query("UPDATE job_queue SET visible_at = 0 WHERE state = 'pending'")
                .execute(db.pool())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.shutdown(Duration::from_secs(2)).await.unwrap();

        let stats = queue.stats("test-queue").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!(handler.handled.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let db = CartographDb::connect_memory().await.unwrap();
        let queue = db.queue();
        for _ in 0..8 {
            queue
                .enqueue(
                    "test-queue",
                    &json!({}),
                    EnqueueOpts {
                        max_attempts: Some(1),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(100),
        });
        let manager = Arc::new(WorkerPoolManager::new(db.queue(), PoolLimits::default()));
        manager.register(
            "test-queue",
            Arc::clone(&handler) as Arc<dyn JobHandler>,
            PoolPolicy {
                idle_backoff_ms: 5,
                breaker_threshold: 3,
                breaker_cooldown_ms: 60_000,
                ..Default::default()
            },
        );
        Arc::clone(&manager).start();

        for _ in 0..200 {
            if manager.status()[0].circuit == CircuitState::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.status()[0].circuit, CircuitState::Open);
        let _ = manager.shutdown(Duration::from_secs(2)).await;
    }
}
