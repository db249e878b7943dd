//! Media worker pool.
//!
//! Workers are spawned once at startup and handed out round-robin as rooms
//! are created. A worker death is unrecoverable: routers, transports and
//! their producers and consumers live inside the worker, and the controller
//! cannot reconcile that partial state. Each worker gets a watcher that
//! marks the process not-live and runs the configured [`FatalAction`] after
//! a grace delay.

use crate::errors::RcError;
use crate::media::{MediaEngine, MediaWorker, WorkerSettings};
use crate::observability::{metrics, HealthState};
use common::types::WorkerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Invoked once a dead worker's grace delay has elapsed.
///
/// The binary exits the process; tests record the call.
pub type FatalAction = Arc<dyn Fn(&WorkerId, &str) + Send + Sync>;

/// Fixed-size pool of media workers.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `count` workers on `engine`.
    ///
    /// # Errors
    ///
    /// Returns `RcError::EngineFatal` if `count` is zero or any worker fails
    /// to start.
    #[instrument(skip_all, name = "rc.workers.spawn", fields(count = count))]
    pub async fn spawn(
        engine: &dyn MediaEngine,
        settings: &WorkerSettings,
        count: usize,
    ) -> Result<Self, RcError> {
        if count == 0 {
            return Err(RcError::EngineFatal(
                "worker pool requires at least one worker".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let worker = engine.create_worker(settings).await.map_err(|e| {
                error!(target: "rc.workers", error = %e, index, "Failed to start media worker");
                RcError::EngineFatal(e.to_string())
            })?;
            info!(
                target: "rc.workers",
                worker_id = %worker.id(),
                index,
                "Media worker started"
            );
            workers.push(worker);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Next worker in round-robin order.
    ///
    /// # Errors
    ///
    /// Returns `RcError::EngineFatal` if the pool is empty.
    pub fn next_worker(&self) -> Result<Arc<dyn MediaWorker>, RcError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len().max(1);
        self.workers
            .get(index)
            .cloned()
            .ok_or_else(|| RcError::EngineFatal("worker pool is empty".to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn one death watcher per worker.
    ///
    /// Watchers exit quietly when `cancel_token` is cancelled. Once a death
    /// is observed the grace delay always runs to completion.
    pub fn watch_deaths(
        &self,
        grace: Duration,
        health: Arc<HealthState>,
        on_fatal: FatalAction,
        cancel_token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|worker| {
                tokio::spawn(watch_worker(
                    Arc::clone(worker),
                    grace,
                    Arc::clone(&health),
                    Arc::clone(&on_fatal),
                    cancel_token.clone(),
                ))
            })
            .collect()
    }

    /// Close every worker.
    pub fn close(&self) {
        for worker in &self.workers {
            worker.close();
        }
    }
}

async fn watch_worker(
    worker: Arc<dyn MediaWorker>,
    grace: Duration,
    health: Arc<HealthState>,
    on_fatal: FatalAction,
    cancel_token: CancellationToken,
) {
    let reason = tokio::select! {
        () = cancel_token.cancelled() => {
            debug!(target: "rc.workers", worker_id = %worker.id(), "Worker watcher stopped");
            return;
        }
        reason = worker.died() => reason,
    };

    error!(
        target: "rc.workers",
        worker_id = %worker.id(),
        reason = %reason,
        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        "Media worker died, exiting after grace delay"
    );
    health.mark_worker_lost(worker.id(), &reason);
    metrics::record_worker_death();

    tokio::time::sleep(grace).await;
    on_fatal(worker.id(), &reason);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::media::LoopbackEngine;
    use std::sync::Mutex;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            log_level: "warn".to_string(),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }

    fn recording_action() -> (FatalAction, Arc<Mutex<Vec<(WorkerId, String)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let action: FatalAction = Arc::new(move |id: &WorkerId, reason: &str| {
            sink.lock().unwrap().push((id.clone(), reason.to_string()));
        });
        (action, calls)
    }

    #[tokio::test]
    async fn test_spawn_requires_workers() {
        let engine = LoopbackEngine::default();
        let result = WorkerPool::spawn(&engine, &settings(), 0).await;
        assert!(matches!(result, Err(RcError::EngineFatal(_))));
    }

    #[tokio::test]
    async fn test_round_robin_wraps() {
        let engine = LoopbackEngine::default();
        let pool = WorkerPool::spawn(&engine, &settings(), 3).await.unwrap();
        assert_eq!(pool.len(), 3);

        let picks: Vec<WorkerId> = (0..7)
            .map(|_| pool.next_worker().unwrap().id().clone())
            .collect();

        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_eq!(picks[0], picks[6]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_runs_fatal_action_after_grace() {
        let engine = LoopbackEngine::default();
        let pool = WorkerPool::spawn(&engine, &settings(), 2).await.unwrap();
        let health = Arc::new(HealthState::new());
        health.mark_serving();
        let (action, calls) = recording_action();

        let handles = pool.watch_deaths(
            Duration::from_secs(2),
            Arc::clone(&health),
            action,
            CancellationToken::new(),
        );

        let victim = engine.workers()[1].clone();
        victim.kill("segfault");

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!health.is_live());
        assert!(matches!(
            health.phase(),
            crate::observability::Lifecycle::WorkerLost { ref reason, .. } if reason == "segfault"
        ));
        assert!(calls.lock().unwrap().is_empty(), "Grace delay not yet elapsed");

        tokio::time::sleep(Duration::from_millis(600)).await;
        let recorded = calls.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(&recorded[0].0, victim.id());
        assert_eq!(recorded[0].1, "segfault");

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_watchers_stop_on_cancel() {
        let engine = LoopbackEngine::default();
        let pool = WorkerPool::spawn(&engine, &settings(), 2).await.unwrap();
        let (action, calls) = recording_action();
        let cancel_token = CancellationToken::new();

        let handles = pool.watch_deaths(
            Duration::ZERO,
            Arc::new(HealthState::new()),
            action,
            cancel_token.clone(),
        );
        cancel_token.cancel();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(calls.lock().unwrap().is_empty());
    }
}
