//! Room Controller
//!
//! Multi-party WebRTC session orchestrator with WebSocket signaling.
//!
//! # Servers
//!
//! - WebSocket signaling server at `/ws` (default: 0.0.0.0:3016)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Spawn the media worker pool and its death watchers
//! 4. Spawn the room registry actor
//! 5. Start the health server, then the signaling server
//! 6. Wait for shutdown signal
//!
//! A media worker death exits the process with status 1 after
//! `RC_WORKER_DEATH_GRACE_MS`.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use common::config::LogFormat;
use common::types::WorkerId;
use room_controller::actors::{ActorMetrics, RoomRegistryHandle};
use room_controller::config::Config;
use room_controller::media::LoopbackEngine;
use room_controller::observability::{health_router, init_metrics_recorder, HealthState};
use room_controller::room::RoomSettings;
use room_controller::signaling::{signaling_router, SignalingDispatcher, SignalingState};
use room_controller::workers::{FatalAction, WorkerPool};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on closing every room during shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_filter.clone().into());
    match config.observability.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting Room Controller");
    info!(
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = config.num_workers,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        listen_ip = %config.listen_ip,
        announced_ip = ?config.announced_ip,
        router_ready_timeout_ms = u64::try_from(config.router_ready_timeout.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media workers
    let engine = LoopbackEngine::default();
    let workers = Arc::new(
        WorkerPool::spawn(&engine, &config.worker_settings(), config.num_workers)
            .await
            .context("Failed to start media workers")?,
    );

    let exit_on_death: FatalAction = Arc::new(|worker_id: &WorkerId, reason: &str| {
        error!(worker_id = %worker_id, reason = %reason, "Exiting after media worker death");
        std::process::exit(1);
    });

    // Actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        Arc::clone(&workers),
        Arc::new(RoomSettings::from_config(&config)),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Cancelled with the registry; every server and watcher hangs off it
    let shutdown_token = registry.child_token();

    let _watchers = workers.watch_deaths(
        config.worker_death_grace,
        Arc::clone(&health_state),
        exit_on_death,
        shutdown_token.child_token(),
    );

    // Health server (liveness, readiness and Prometheus /metrics)
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("Invalid health bind address: {}", config.health_bind_address))?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().with_context(|| {
        format!(
            "Invalid signaling bind address: {}",
            config.signaling_bind_address
        )
    })?;
    let signaling_app = signaling_router(SignalingState {
        dispatcher: SignalingDispatcher::new(registry.clone()),
        metrics: Arc::clone(&actor_metrics),
        event_buffer: config.event_buffer,
        cancel_token: shutdown_token.child_token(),
    });
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .with_context(|| format!("Failed to bind signaling server to {signaling_addr}"))?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    if !health_state.mark_serving() {
        warn!(phase = health_state.phase().as_str(), "Not marking ready, startup already failed");
    }
    info!("Room Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.mark_draining();

    shutdown_token.cancel();

    // Closes every room, then cancels the registry token
    if let Err(e) = registry.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Room registry shutdown error");
    }
    workers.close();

    info!("Room Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
