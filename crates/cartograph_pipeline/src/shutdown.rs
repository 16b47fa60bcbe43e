//! Graceful shutdown coordination.
//!
//! Components register into dependency-ordered buckets (workers first,
//! cleanup last). One shutdown runs at a time - a concurrent call is
//! rejected, not queued. Each phase shuts its registrants down
//! sequentially in descending priority with a per-phase budget split
//! across them and bounded retries per operation; blowing the budget
//! flips to a force pass that runs everything left in parallel with a
//! short per-op cap.

use futures::future::BoxFuture;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use cartograph_protocol::config::defaults;

use crate::error::PipelineError;

/// Shutdown phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    Starting,
    Workers,
    Managers,
    Connections,
    Cleanup,
    Completed,
    Failed,
}

impl ShutdownState {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownState::Idle => "idle",
            ShutdownState::Starting => "starting",
            ShutdownState::Workers => "workers",
            ShutdownState::Managers => "managers",
            ShutdownState::Connections => "connections",
            ShutdownState::Cleanup => "cleanup",
            ShutdownState::Completed => "completed",
            ShutdownState::Failed => "failed",
        }
    }
}

/// Bucket a registrant shuts down in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownBucket {
    Workers,
    Managers,
    Connections,
    Cleanup,
}

impl ShutdownBucket {
    const ORDER: [ShutdownBucket; 4] = [
        ShutdownBucket::Workers,
        ShutdownBucket::Managers,
        ShutdownBucket::Connections,
        ShutdownBucket::Cleanup,
    ];

    fn state(self) -> ShutdownState {
        match self {
            ShutdownBucket::Workers => ShutdownState::Workers,
            ShutdownBucket::Managers => ShutdownState::Managers,
            ShutdownBucket::Connections => ShutdownState::Connections,
            ShutdownBucket::Cleanup => ShutdownState::Cleanup,
        }
    }
}

/// Observability events emitted over the broadcast channel.
#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    ShutdownStarted,
    StateTransition {
        from: ShutdownState,
        to: ShutdownState,
    },
    ShutdownCompleted {
        elapsed_ms: u64,
    },
    ShutdownFailed {
        phase: ShutdownState,
        error: String,
    },
}

/// A shutdown operation: receives its per-op timeout budget.
pub type ShutdownOp =
    Box<dyn Fn(Duration) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct Registrant {
    name: String,
    bucket: ShutdownBucket,
    priority: i32,
    op: ShutdownOp,
}

/// Shutdown report: what ran, what was forced, what failed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub completed: Vec<String>,
    pub forced: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed_ms: u64,
}

/// Coordinator configuration.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub phase_timeout_ms: u64,
    pub retry_attempts: u32,
    pub force_op_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: defaults::SHUTDOWN_PHASE_TIMEOUT_MS,
            retry_attempts: defaults::SHUTDOWN_RETRY_ATTEMPTS,
            force_op_timeout_ms: defaults::FORCE_SHUTDOWN_OP_TIMEOUT_MS,
        }
    }
}

pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    registrants: Mutex<Vec<Registrant>>,
    guard: tokio::sync::Mutex<()>,
    state: Mutex<ShutdownState>,
    events: broadcast::Sender<ShutdownEvent>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            registrants: Mutex::new(Vec::new()),
            guard: tokio::sync::Mutex::new(()),
            state: Mutex::new(ShutdownState::Idle),
            events,
        }
    }

    /// Register a component. Higher priority shuts down earlier within
    /// its bucket.
    pub fn register<F, Fut>(&self, name: impl Into<String>, bucket: ShutdownBucket, priority: i32, op: F)
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.registrants
            .lock()
            .expect("registrants poisoned")
            .push(Registrant {
                name: name.into(),
                bucket,
                priority,
                op: Box::new(move |timeout| Box::pin(op(timeout))),
            });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().expect("state poisoned")
    }

    fn transition(&self, to: ShutdownState) {
        let mut state = self.state.lock().expect("state poisoned");
        let from = *state;
        *state = to;
        let _ = self.events.send(ShutdownEvent::StateTransition { from, to });
    }

    /// Execute the shutdown. A second concurrent call returns
    /// `ShutdownInProgress` immediately.
    pub async fn shutdown(&self) -> Result<ShutdownReport, PipelineError> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| PipelineError::ShutdownInProgress)?;

        let started = Instant::now();
        let _ = self.events.send(ShutdownEvent::ShutdownStarted);
        self.transition(ShutdownState::Starting);
        info!("Shutdown started");

        let mut report = ShutdownReport::default();
        let mut force_needed = false;

        for bucket in ShutdownBucket::ORDER {
            self.transition(bucket.state());
            if !self.run_phase(bucket, &mut report).await {
                force_needed = true;
                break;
            }
        }

        if force_needed {
            warn!("Phase budget exceeded, forcing remaining shutdowns");
            self.force_remaining(&mut report).await;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.failed.is_empty() {
            self.transition(ShutdownState::Completed);
            let _ = self.events.send(ShutdownEvent::ShutdownCompleted {
                elapsed_ms: report.elapsed_ms,
            });
            info!(elapsed_ms = report.elapsed_ms, "Shutdown completed");
        } else {
            self.transition(ShutdownState::Failed);
            let _ = self.events.send(ShutdownEvent::ShutdownFailed {
                phase: self.state(),
                error: report.failed.join(", "),
            });
            error!(failed = ?report.failed, "Shutdown failed");
        }
        Ok(report)
    }

    /// Run one bucket sequentially in descending priority. Returns false
    /// when the phase budget is exhausted.
    async fn run_phase(&self, bucket: ShutdownBucket, report: &mut ShutdownReport) -> bool {
        let mut names: Vec<(String, i32)> = {
            let registrants = self.registrants.lock().expect("registrants poisoned");
            registrants
                .iter()
                .filter(|r| r.bucket == bucket && !report.completed.contains(&r.name))
                .map(|r| (r.name.clone(), r.priority))
                .collect()
        };
        if names.is_empty() {
            return true;
        }
        names.sort_by(|a, b| b.1.cmp(&a.1));

        let phase_budget = Duration::from_millis(self.config.phase_timeout_ms);
        let per_op = phase_budget / names.len() as u32;
        let deadline = Instant::now() + phase_budget;

        for (name, _) in names {
            if Instant::now() >= deadline {
                return false;
            }
            let op_timeout = per_op.min(deadline.saturating_duration_since(Instant::now()));
            match self.run_op(&name, op_timeout).await {
                Ok(()) => report.completed.push(name),
                Err(e) => {
                    warn!(component = %name, error = %e, "Shutdown op failed after retries");
                    return false;
                }
            }
        }
        true
    }

    /// One op with bounded retries and backoff inside its timeout budget.
    async fn run_op(&self, name: &str, timeout: Duration) -> Result<(), String> {
        let fut_for = |timeout: Duration| {
            let registrants = self.registrants.lock().expect("registrants poisoned");
            registrants
                .iter()
                .find(|r| r.name == name)
                .map(|r| (r.op)(timeout))
        };

        let mut last_err = String::new();
        for attempt in 0..=self.config.retry_attempts {
            let Some(fut) = fut_for(timeout) else {
                return Ok(());
            };
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = format!("timed out after {}ms", timeout.as_millis()),
            }
            if attempt < self.config.retry_attempts {
                tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
            }
        }
        Err(last_err)
    }

    /// Force pass: everything not yet completed, in parallel, short per-op
    /// cap, best effort.
    async fn force_remaining(&self, report: &mut ShutdownReport) {
        let cap = Duration::from_millis(self.config.force_op_timeout_ms);
        let remaining: Vec<(String, BoxFuture<'static, Result<(), String>>)> = {
            let registrants = self.registrants.lock().expect("registrants poisoned");
            registrants
                .iter()
                .filter(|r| !report.completed.contains(&r.name))
                .map(|r| (r.name.clone(), (r.op)(cap)))
                .collect()
        };

        let tasks: Vec<_> = remaining
            .into_iter()
            .map(|(name, fut)| {
                tokio::spawn(async move {
                    let outcome = tokio::time::timeout(cap, fut).await;
                    (name, matches!(outcome, Ok(Ok(()))))
                })
            })
            .collect();

        for task in tasks {
            match task.await {
                Ok((name, true)) => report.forced.push(name),
                Ok((name, false)) => report.failed.push(name),
                Err(e) => report.failed.push(format!("join: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn coordinator() -> ShutdownCoordinator {
        ShutdownCoordinator::new(ShutdownConfig {
            phase_timeout_ms: 500,
            retry_attempts: 1,
            force_op_timeout_ms: 100,
        })
    }

    #[tokio::test]
    async fn test_phases_run_in_order_and_priority() {
        let coordinator = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, bucket, priority) in [
            ("cleanup", ShutdownBucket::Cleanup, 0),
            ("db", ShutdownBucket::Connections, 0),
            ("pool-low", ShutdownBucket::Workers, 1),
            ("pool-high", ShutdownBucket::Workers, 9),
            ("publisher", ShutdownBucket::Managers, 0),
        ] {
            let order = Arc::clone(&order);
            coordinator.register(name, bucket, priority, move |_t| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name.to_string());
                    Ok(())
                }
            });
        }

        let report = coordinator.shutdown().await.unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Completed);
        assert!(report.failed.is_empty());
        assert_eq!(
            *order.lock().unwrap(),
            ["pool-high", "pool-low", "publisher", "db", "cleanup"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_rejected() {
        let coordinator = Arc::new(coordinator());
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let gate_in = Arc::clone(&gate);
        coordinator.register("slow", ShutdownBucket::Workers, 0, move |_t| {
            let gate = Arc::clone(&gate_in);
            async move {
                let _ = gate.acquire().await;
                Ok(())
            }
        });

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.shutdown().await })
        };
        // Let the first call take the guard
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coordinator.shutdown().await;
        assert!(matches!(second, Err(PipelineError::ShutdownInProgress)));

        gate.add_permits(10);
        let report = first.await.unwrap().unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Completed);
        assert!(report.completed.contains(&"slow".to_string()));
    }

    #[tokio::test]
    async fn test_failing_op_retries_then_forces() {
        let coordinator = coordinator();
        let attempts = Arc::new(AtomicUsize::new(0));

        let attempts_in = Arc::clone(&attempts);
        coordinator.register("flaky", ShutdownBucket::Workers, 0, move |_t| {
            let attempts = Arc::clone(&attempts_in);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("still busy".to_string())
            }
        });
        coordinator.register("fine", ShutdownBucket::Cleanup, 0, |_t| async { Ok(()) });

        let report = coordinator.shutdown().await.unwrap();
        // Initial attempt + 1 retry, then one forced attempt
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert!(report.failed.contains(&"flaky".to_string()));
        // The healthy registrant still ran in the force pass
        assert!(report.forced.contains(&"fine".to_string()));
        assert_eq!(coordinator.state(), ShutdownState::Failed);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let coordinator = coordinator();
        coordinator.register("x", ShutdownBucket::Workers, 0, |_t| async { Ok(()) });
        let mut events = coordinator.subscribe();

        coordinator.shutdown().await.unwrap();

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ShutdownEvent::ShutdownStarted => saw_started = true,
                ShutdownEvent::ShutdownCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }
}
