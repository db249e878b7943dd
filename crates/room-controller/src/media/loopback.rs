//! In-process loopback media engine.
//!
//! Tracks workers, routers, transports, producers and consumers the way a
//! real engine would (ids, liveness, close cascades, capability checks) but
//! moves no media. Backs the binary in development deployments and every
//! test in the crate.
//!
//! Engine-side closures mirror a real SFU: closing a producer closes each
//! downstream consumer and reports [`EngineEvent::ConsumerClosed`] on the
//! consumer's router channel. Remote-initiated closures can be injected with
//! [`LoopbackEngine::close_transport_remote`] and
//! [`LoopbackEngine::close_producer_remote`].

use super::{
    EngineError, EngineEvent, EngineEventSender, MediaConsumer, MediaEngine, MediaKind,
    MediaProducer, MediaRouter, MediaTransport, MediaWorker, RtpCodec, TransportParams,
    WebRtcTransportOptions, WorkerSettings,
};
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Knobs for simulating engine behavior.
#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    /// Delay before `create_router` completes.
    pub router_delay: Duration,
    /// Make every `create_router` call fail.
    pub fail_router_creation: bool,
    /// Delay before transport creation, `connect`, `produce` and `consume`
    /// return. The engine object exists while the call is pending.
    pub call_delay: Duration,
}

/// Loopback engine. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    options: LoopbackOptions,
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<Arc<LoopbackWorker>>>>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared::default()),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Workers created so far, in creation order.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<LoopbackWorker>> {
        lock(&self.workers).clone()
    }

    /// Close a transport as if its DTLS state went to `closed`.
    ///
    /// Returns `false` if the transport was not open.
    pub fn close_transport_remote(&self, transport_id: &TransportId) -> bool {
        let mut state = self.shared.state();
        let Some(events) = state
            .transports
            .get(transport_id)
            .map(|record| record.events.clone())
        else {
            return false;
        };
        state.close_transport(transport_id);
        let _ = events.send(EngineEvent::TransportClosed {
            transport_id: transport_id.clone(),
        });
        true
    }

    /// Close a producer from the engine side.
    ///
    /// Returns `false` if the producer was not open.
    pub fn close_producer_remote(&self, producer_id: &ProducerId) -> bool {
        let mut state = self.shared.state();
        let Some(events) = state
            .producers
            .get(producer_id)
            .map(|record| record.events.clone())
        else {
            return false;
        };
        state.close_producer(producer_id);
        let _ = events.send(EngineEvent::ProducerClosed {
            producer_id: producer_id.clone(),
        });
        true
    }

    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.shared.state().transports.len()
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.shared.state().producers.len()
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.shared.state().consumers.len()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::InvalidParameters(format!(
                "rtc port range {}-{} is empty",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let (died_tx, _) = watch::channel(None);
        let worker = Arc::new(LoopbackWorker {
            id: WorkerId::random(),
            options: self.options.clone(),
            settings: settings.clone(),
            shared: Arc::clone(&self.shared),
            next_port: AtomicU32::new(0),
            died_tx,
            routers: Mutex::new(Vec::new()),
        });

        debug!(
            target: "rc.media",
            worker_id = %worker.id,
            log_level = %settings.log_level,
            "Loopback worker created"
        );

        lock(&self.workers).push(Arc::clone(&worker));
        Ok(worker)
    }
}

/// Loopback worker.
pub struct LoopbackWorker {
    id: WorkerId,
    options: LoopbackOptions,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    next_port: AtomicU32,
    died_tx: watch::Sender<Option<String>>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
}

impl LoopbackWorker {
    /// Simulate the worker process dying.
    pub fn kill(&self, reason: &str) {
        warn!(target: "rc.media", worker_id = %self.id, reason, "Loopback worker killed");
        self.died_tx.send_replace(Some(reason.to_string()));
        self.close_routers();
    }

    fn is_dead(&self) -> bool {
        self.died_tx.borrow().is_some()
    }

    fn close_routers(&self) {
        let routers: Vec<_> = lock(&self.routers).drain(..).collect();
        for router in routers {
            router.close();
        }
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.settings.rtc_max_port) - u32::from(self.settings.rtc_min_port) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(u32::from(self.settings.rtc_min_port) + offset)
            .unwrap_or(self.settings.rtc_min_port)
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodec],
        events: EngineEventSender,
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if !self.options.router_delay.is_zero() {
            tokio::time::sleep(self.options.router_delay).await;
        }
        if self.is_dead() {
            return Err(EngineError::WorkerDied(self.id.to_string()));
        }
        if self.options.fail_router_creation {
            return Err(EngineError::Unavailable("router creation disabled".to_string()));
        }

        let router = Arc::new(LoopbackRouter {
            id: RouterId::random(),
            call_delay: self.options.call_delay,
            codecs: codecs.to_vec(),
            events,
            shared: Arc::clone(&self.shared),
            port: self.allocate_port(),
            closed: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
        });
        lock(&self.routers).push(Arc::clone(&router));
        Ok(router)
    }

    async fn died(&self) -> String {
        let mut rx = self.died_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            // Sender lives as long as the worker.
            None => std::future::pending().await,
        }
    }

    fn close(&self) {
        self.close_routers();
    }
}

struct LoopbackRouter {
    id: RouterId,
    call_delay: Duration,
    codecs: Vec<RtpCodec>,
    events: EngineEventSender,
    shared: Arc<Shared>,
    port: u16,
    closed: AtomicBool,
    transports: Mutex<Vec<TransportId>>,
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        let codecs: Vec<Value> = self
            .codecs
            .iter()
            .zip(100u8..)
            .map(|(codec, payload_type)| {
                let mut entry = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": payload_type,
                    "parameters": codec.parameters,
                });
                if let (Some(channels), Some(obj)) = (codec.channels, entry.as_object_mut()) {
                    obj.insert("channels".to_string(), json!(channels));
                }
                entry
            })
            .collect();
        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        let state = self.shared.state();
        let Some(producer) = state.producers.get(producer_id) else {
            return false;
        };
        if producer.router_id != self.id {
            return false;
        }
        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs
                    .iter()
                    .any(|c| c.get("kind").and_then(Value::as_str) == Some(producer.kind.as_str()))
            })
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("router".to_string()));
        }

        let id = TransportId::random();
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let udp_priority: u32 = if options.prefer_udp {
            1_076_302_079
        } else {
            1_076_302_078
        };
        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": udp_priority,
                "ip": ip,
                "protocol": "udp",
                "port": self.port,
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": 1_076_276_479u32,
                "ip": ip,
                "protocol": "tcp",
                "port": self.port,
                "type": "host",
                "tcpType": "passive",
            }));
        }

        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": uuid::Uuid::new_v4().simple().to_string(),
                "password": uuid::Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
                }],
            }),
        };

        let closed = Arc::new(AtomicBool::new(false));
        self.shared.state().transports.insert(
            id.clone(),
            TransportRecord {
                closed: Arc::clone(&closed),
                events: self.events.clone(),
            },
        );
        lock(&self.transports).push(id.clone());

        let transport = Arc::new(LoopbackTransport {
            id,
            router_id: self.id.clone(),
            call_delay: self.call_delay,
            params,
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            closed,
            connected: AtomicBool::new(false),
            max_incoming_bitrate: AtomicU32::new(0),
        });
        reply_latency(self.call_delay).await;
        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = lock(&self.transports).drain(..).collect();
        let mut state = self.shared.state();
        for transport_id in &transports {
            state.close_transport(transport_id);
        }
    }
}

struct LoopbackTransport {
    id: TransportId,
    router_id: RouterId,
    call_delay: Duration,
    params: TransportParams,
    events: EngineEventSender,
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    connected: AtomicBool,
    max_incoming_bitrate: AtomicU32,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !dtls_parameters.is_object() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters must be an object".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidParameters(
                "transport already connected".to_string(),
            ));
        }
        reply_latency(self.call_delay).await;
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.max_incoming_bitrate.store(bitrate, Ordering::Relaxed);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn MediaProducer>, EngineError> {
        self.ensure_open()?;
        if !rtp_parameters.is_object() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters must be an object".to_string(),
            ));
        }

        let id = ProducerId::random();
        let closed = Arc::new(AtomicBool::new(false));
        self.shared.state().producers.insert(
            id.clone(),
            ProducerRecord {
                router_id: self.router_id.clone(),
                transport_id: self.id.clone(),
                kind,
                rtp_parameters,
                closed: Arc::clone(&closed),
                events: self.events.clone(),
            },
        );

        let producer = Arc::new(LoopbackProducer {
            id,
            kind,
            shared: Arc::clone(&self.shared),
        });
        reply_latency(self.call_delay).await;
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError> {
        self.ensure_open()?;
        if !rtp_capabilities.is_object() {
            return Err(EngineError::InvalidParameters(
                "rtpCapabilities must be an object".to_string(),
            ));
        }

        let id = ConsumerId::random();
        let closed = Arc::new(AtomicBool::new(false));
        let (kind, rtp_parameters) = {
            let mut state = self.shared.state();
            let (kind, rtp_parameters) = match state.producers.get(producer_id) {
                Some(producer) => (producer.kind, producer.rtp_parameters.clone()),
                None => return Err(EngineError::ProducerNotFound(producer_id.clone())),
            };
            state.consumers.insert(
                id.clone(),
                ConsumerRecord {
                    producer_id: producer_id.clone(),
                    transport_id: self.id.clone(),
                    closed: Arc::clone(&closed),
                    events: self.events.clone(),
                },
            );
            (kind, rtp_parameters)
        };

        let consumer = Arc::new(LoopbackConsumer {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed,
            shared: Arc::clone(&self.shared),
        });
        reply_latency(self.call_delay).await;
        Ok(consumer)
    }

    fn close(&self) {
        self.shared.state().close_transport(&self.id);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<Shared>,
}

impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.shared.state().close_producer(&self.id);
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    closed: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> &str {
        "simple"
    }

    fn producer_paused(&self) -> bool {
        false
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.shared.state().close_consumer(&self.id);
    }
}

async fn reply_latency(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<EngineState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

struct TransportRecord {
    closed: Arc<AtomicBool>,
    events: EngineEventSender,
}

struct ProducerRecord {
    router_id: RouterId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: Value,
    closed: Arc<AtomicBool>,
    events: EngineEventSender,
}

struct ConsumerRecord {
    producer_id: ProducerId,
    transport_id: TransportId,
    closed: Arc<AtomicBool>,
    events: EngineEventSender,
}

impl EngineState {
    fn close_transport(&mut self, transport_id: &TransportId) {
        let Some(record) = self.transports.remove(transport_id) else {
            return;
        };
        record.closed.store(true, Ordering::SeqCst);

        let producers: Vec<_> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &producers {
            self.close_producer(producer_id);
        }

        let consumers: Vec<_> = self
            .consumers
            .iter()
            .filter(|(_, c)| &c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in &consumers {
            self.close_consumer(consumer_id);
        }
    }

    /// Close a producer and every consumer of it. Downstream consumers are
    /// reported on their router's event channel.
    fn close_producer(&mut self, producer_id: &ProducerId) {
        let Some(record) = self.producers.remove(producer_id) else {
            return;
        };
        record.closed.store(true, Ordering::SeqCst);

        let downstream: Vec<_> = self
            .consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in downstream {
            if let Some(consumer) = self.consumers.remove(&consumer_id) {
                consumer.closed.store(true, Ordering::SeqCst);
                let _ = consumer
                    .events
                    .send(EngineEvent::ConsumerClosed { consumer_id });
            }
        }
    }

    fn close_consumer(&mut self, consumer_id: &ConsumerId) {
        if let Some(record) = self.consumers.remove(consumer_id) {
            record.closed.store(true, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            log_level: "warn".to_string(),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn codecs() -> Vec<RtpCodec> {
        vec![
            RtpCodec {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
            },
            RtpCodec {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
            },
        ]
    }

    async fn router(
        engine: &LoopbackEngine,
    ) -> (Arc<dyn MediaRouter>, mpsc::UnboundedReceiver<EngineEvent>) {
        let worker = engine.create_worker(&worker_settings()).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let router = worker.create_router(&codecs(), tx).await.unwrap();
        (router, rx)
    }

    #[tokio::test]
    async fn test_router_capabilities_list_configured_codecs() {
        let engine = LoopbackEngine::default();
        let (router, _rx) = router(&engine).await;

        let caps = router.rtp_capabilities();
        let codecs = caps["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0]["mimeType"], "audio/opus");
        assert_eq!(codecs[0]["channels"], 2);
        assert_eq!(codecs[1]["kind"], "video");
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_kind() {
        let engine = LoopbackEngine::default();
        let (router, _rx) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, json!({"codecs": []}))
            .await
            .unwrap();

        let audio_only = json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]});
        let with_video = json!({"codecs": [{"kind": "video", "mimeType": "video/VP8"}]});
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(router.can_consume(producer.id(), &with_video));

        producer.close();
        assert!(!router.can_consume(producer.id(), &with_video));
    }

    #[tokio::test]
    async fn test_producer_close_closes_consumers_and_reports() {
        let engine = LoopbackEngine::default();
        let (router, mut rx) = router(&engine).await;
        let send = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        let producer = send.produce(MediaKind::Audio, json!({})).await.unwrap();
        let consumer = recv
            .consume(producer.id(), json!({"codecs": []}), true)
            .await
            .unwrap();
        assert!(consumer.paused());
        assert_eq!(engine.open_consumers(), 1);

        producer.close();

        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_consumers(), 0);
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ConsumerClosed {
                consumer_id: consumer.id().clone()
            }
        );
        assert!(consumer.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_remote_transport_close_emits_event() {
        let engine = LoopbackEngine::default();
        let (router, mut rx) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();
        transport.produce(MediaKind::Audio, json!({})).await.unwrap();

        assert!(engine.close_transport_remote(transport.id()));
        assert!(!engine.close_transport_remote(transport.id()));

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::TransportClosed {
                transport_id: transport.id().clone()
            }
        );
        assert_eq!(engine.open_transports(), 0);
        assert_eq!(engine.open_producers(), 0);
        assert!(transport.produce(MediaKind::Audio, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let engine = LoopbackEngine::default();
        let (router, _rx) = router(&engine).await;
        let transport = router
            .create_webrtc_transport(&transport_options())
            .await
            .unwrap();

        transport.connect(json!({"role": "client"})).await.unwrap();
        assert!(transport.connect(json!({"role": "client"})).await.is_err());
    }

    #[tokio::test]
    async fn test_killed_worker_resolves_died_and_refuses_routers() {
        let engine = LoopbackEngine::default();
        let worker = engine.create_worker(&worker_settings()).await.unwrap();

        engine.workers()[0].kill("segfault");

        assert_eq!(worker.died().await, "segfault");
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = worker.create_router(&codecs(), tx).await;
        assert!(matches!(result, Err(EngineError::WorkerDied(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_delay_keeps_object_open_while_pending() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            call_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let (router, _rx) = router(&engine).await;

        let creating = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.create_webrtc_transport(&transport_options()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!creating.is_finished());
        assert_eq!(engine.open_transports(), 1);

        let started = tokio::time::Instant::now();
        let transport = creating.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));

        // The delayed transport is torn down with its router like any other.
        router.close();
        assert_eq!(engine.open_transports(), 0);
        assert!(transport.produce(MediaKind::Audio, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_router_failure_option() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            fail_router_creation: true,
            ..Default::default()
        });
        let worker = engine.create_worker(&worker_settings()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            worker.create_router(&codecs(), tx).await,
            Err(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_port_range_rejected() {
        let engine = LoopbackEngine::default();
        let settings = WorkerSettings {
            rtc_min_port: 20000,
            rtc_max_port: 10000,
            ..worker_settings()
        };
        assert!(engine.create_worker(&settings).await.is_err());
    }
}
