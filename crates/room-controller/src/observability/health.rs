//! Process lifecycle as seen by the orchestrator.
//!
//! The Room Controller moves through [`Lifecycle`] phases:
//!
//! ```text
//! Starting ──> Serving ──> Draining
//!     │           │            │
//!     └───────────┴────────────┴──> WorkerLost
//! ```
//!
//! `Starting` covers worker pool spawn and listener binds. `Draining` begins
//! on the shutdown signal, while rooms are being closed. `WorkerLost` is
//! terminal: a media worker died and the process is waiting out its exit
//! grace delay, so every room on that worker is already broken.
//!
//! `GET /health` answers 503 only in `WorkerLost`; `GET /ready` answers 200
//! only in `Serving`. Both bodies name the current phase. The `/metrics`
//! endpoint shares the listener and is merged in by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use common::types::WorkerId;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Lifecycle phase of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Serving,
    Draining,
    WorkerLost { worker_id: WorkerId, reason: String },
}

impl Lifecycle {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Serving => "serving",
            Lifecycle::Draining => "draining",
            Lifecycle::WorkerLost { .. } => "worker_lost",
        }
    }
}

/// Shared lifecycle phase, updated by the binary and the worker watchers.
#[derive(Debug)]
pub struct HealthState {
    phase: watch::Sender<Lifecycle>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: watch::channel(Lifecycle::Starting).0,
        }
    }

    /// Workers and listeners are up. Only leaves `Starting`; returns
    /// `false` if the process had already moved past it.
    pub fn mark_serving(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase != Lifecycle::Starting {
                return false;
            }
            *phase = Lifecycle::Serving;
            true
        })
    }

    /// Shutdown began. A lost worker stays reported as such.
    pub fn mark_draining(&self) {
        self.phase.send_if_modified(|phase| match phase {
            Lifecycle::Starting | Lifecycle::Serving => {
                *phase = Lifecycle::Draining;
                true
            }
            Lifecycle::Draining | Lifecycle::WorkerLost { .. } => false,
        });
    }

    /// A media worker died. The first death is kept.
    pub fn mark_worker_lost(&self, worker_id: &WorkerId, reason: &str) {
        let changed = self.phase.send_if_modified(|phase| {
            if matches!(phase, Lifecycle::WorkerLost { .. }) {
                return false;
            }
            *phase = Lifecycle::WorkerLost {
                worker_id: worker_id.clone(),
                reason: reason.to_string(),
            };
            true
        });
        if !changed {
            warn!(
                target: "rc.workers",
                worker_id = %worker_id,
                reason,
                "Further worker death while already failing"
            );
        }
    }

    #[must_use]
    pub fn phase(&self) -> Lifecycle {
        self.phase.borrow().clone()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(*self.phase.borrow(), Lifecycle::WorkerLost { .. })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.phase.borrow() == Lifecycle::Serving
    }
}

/// `/health` and `/ready` over `health_state`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let phase = state.phase();
    let status = if matches!(phase, Lifecycle::WorkerLost { .. }) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, phase.as_str())
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let phase = state.phase();
    let status = if phase == Lifecycle::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, phase.as_str())
}
