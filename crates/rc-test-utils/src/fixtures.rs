//! Pre-wired room controller for tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use room_controller::actors::{ActorMetrics, RoomRegistryHandle};
use room_controller::config::default_media_codecs;
use room_controller::media::{
    LoopbackEngine, LoopbackOptions, WebRtcTransportOptions, WorkerSettings,
};
use room_controller::room::RoomSettings;
use room_controller::signaling::SignalingDispatcher;
use room_controller::workers::WorkerPool;
use tokio_util::sync::CancellationToken;

use crate::client::TestClient;

/// Worker settings with a small port range.
#[must_use]
pub fn test_worker_settings() -> WorkerSettings {
    WorkerSettings {
        log_level: "warn".to_string(),
        rtc_min_port: 40000,
        rtc_max_port: 40999,
    }
}

/// Room settings listening on localhost with the default codec set.
#[must_use]
pub fn test_room_settings(router_ready_timeout: Duration) -> RoomSettings {
    RoomSettings {
        media_codecs: default_media_codecs(),
        transport_options: WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        },
        max_incoming_bitrate: Some(1_500_000),
        router_ready_timeout,
    }
}

/// Builder for [`TestServer`].
#[derive(Debug, Clone)]
pub struct TestServerBuilder {
    options: LoopbackOptions,
    workers: usize,
    router_ready_timeout: Duration,
    event_buffer: usize,
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self {
            options: LoopbackOptions::default(),
            workers: 2,
            router_ready_timeout: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

impl TestServerBuilder {
    /// Delay every router creation by `delay`.
    #[must_use]
    pub fn router_delay(mut self, delay: Duration) -> Self {
        self.options.router_delay = delay;
        self
    }

    /// Make every router creation fail.
    #[must_use]
    pub fn failing_routers(mut self) -> Self {
        self.options.fail_router_creation = true;
        self
    }

    /// Delay engine replies to transport creation, `connect`, `produce` and
    /// `consume` by `delay`.
    #[must_use]
    pub fn engine_call_delay(mut self, delay: Duration) -> Self {
        self.options.call_delay = delay;
        self
    }

    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    #[must_use]
    pub fn router_ready_timeout(mut self, timeout: Duration) -> Self {
        self.router_ready_timeout = timeout;
        self
    }

    #[must_use]
    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Spawn the worker pool and the registry.
    ///
    /// # Panics
    ///
    /// Panics if the worker pool cannot be started.
    pub async fn build(self) -> TestServer {
        let engine = LoopbackEngine::new(self.options);
        let pool = WorkerPool::spawn(&engine, &test_worker_settings(), self.workers)
            .await
            .expect("loopback workers should start");
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            Arc::new(pool),
            Arc::new(test_room_settings(self.router_ready_timeout)),
            Arc::clone(&metrics),
        );

        TestServer {
            engine,
            dispatcher: SignalingDispatcher::new(registry.clone()),
            registry,
            metrics,
            event_buffer: self.event_buffer,
            cancel_token: CancellationToken::new(),
        }
    }
}

/// An in-process room controller on the loopback engine.
pub struct TestServer {
    /// Engine handle for simulating remote closes and inspecting state.
    pub engine: LoopbackEngine,
    pub registry: RoomRegistryHandle,
    pub dispatcher: SignalingDispatcher,
    pub metrics: Arc<ActorMetrics>,
    pub event_buffer: usize,
    /// Parent token of every connection opened through [`Self::connect`].
    pub cancel_token: CancellationToken,
}

impl TestServer {
    #[must_use]
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Start a server with default settings.
    pub async fn start() -> Self {
        Self::builder().build().await
    }

    /// Open a signaling connection with the given connection id.
    #[must_use]
    pub fn connect(&self, connection_id: &str) -> TestClient {
        TestClient::spawn(
            connection_id,
            self.dispatcher.clone(),
            self.event_buffer,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.registry.cancel();
    }
}
