//! Room state and orchestration.
//!
//! A [`Room`] owns one router (acquired asynchronously from its worker) and
//! the [`Peer`]s joined to it. Peer bookkeeping lives behind a single async
//! mutex that is never held across an engine call. Operations that create
//! engine objects take what they need under the lock, release it, await the
//! engine, then re-lock and commit only if the room, the peer and (for
//! `consume`) the upstream producer are still there. Otherwise the fresh
//! engine object is closed and the caller gets the matching not-found
//! error, so a `consume` racing a `closeProducer` never leaves a consumer
//! behind. Event fan-out happens after the lock is released and never
//! blocks (see [`EventSink::deliver`]).
//!
//! # Close cascades
//!
//! 1. transport close removes the producers and consumers bound to it
//! 2. producer removal closes every downstream consumer in every peer and
//!    sends `consumerClosed` to each consumer's owner
//! 3. consumer removal never touches producers
//!
//! The same cascade runs for locally initiated closes and for
//! [`EngineEvent`]s the engine reports on its own, and is idempotent.
//!
//! # Router readiness
//!
//! Router acquisition starts when the room is created. Callers that need
//! the router wait on a one-shot readiness signal bounded by the configured
//! timeout; all concurrent waiters are released by the same completion.

pub mod peer;

pub use peer::{EventSink, Peer};

use crate::config::Config;
use crate::errors::RcError;
use crate::media::{
    EngineEvent, MediaConsumer, MediaKind, MediaRouter, MediaSource, MediaWorker, RtpCodec,
    TransportParams, WebRtcTransportOptions,
};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Event pushed to a peer outside of any request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PeerEvent {
    /// Producers the peer may consume.
    NewProducers(Vec<ProducerInfo>),
    /// One of the peer's consumers was closed by the server.
    ConsumerClosed { consumer_id: ConsumerId },
    /// Another peer failed to acquire local media.
    PeerMediaError {
        peer_id: PeerId,
        source: MediaSource,
        message: String,
    },
}

impl PeerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            PeerEvent::NewProducers(_) => "newProducers",
            PeerEvent::ConsumerClosed { .. } => "consumerClosed",
            PeerEvent::PeerMediaError { .. } => "peerMediaError",
        }
    }
}

/// Entry of the room-wide producer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub producer_socket_id: PeerId,
    pub producer_name: String,
    pub kind: MediaKind,
    pub source: MediaSource,
}

/// Parameters a client needs to receive a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

impl ConsumerParams {
    fn from_consumer(consumer: &dyn MediaConsumer) -> Self {
        Self {
            producer_id: consumer.producer_id().clone(),
            id: consumer.id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type().to_string(),
            producer_paused: consumer.producer_paused(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub name: String,
}

/// Serializable view of a room: `{id, peers: [{id, name}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub peers: Vec<PeerSummary>,
}

/// Settings shared by every room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub media_codecs: Vec<RtpCodec>,
    pub transport_options: WebRtcTransportOptions,
    pub max_incoming_bitrate: Option<u32>,
    pub router_ready_timeout: Duration,
}

impl RoomSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            media_codecs: config.media_codecs.clone(),
            transport_options: config.transport_options(),
            max_incoming_bitrate: config.max_incoming_bitrate,
            router_ready_timeout: config.router_ready_timeout,
        }
    }
}

enum RouterState {
    Pending,
    Ready(Arc<dyn MediaRouter>),
    Failed(String),
}

type Notice = (EventSink, PeerEvent);

struct RoomState {
    peers: HashMap<PeerId, Peer>,
}

impl RoomState {
    fn sinks_except(&self, excluded: &PeerId) -> Vec<EventSink> {
        self.peers
            .values()
            .filter(|peer| peer.id() != excluded)
            .map(|peer| peer.sink().clone())
            .collect()
    }

    /// Close every consumer downstream of `producer_ids`, in every peer.
    fn close_downstream(&mut self, producer_ids: &[ProducerId]) -> Vec<Notice> {
        if producer_ids.is_empty() {
            return Vec::new();
        }
        let mut notices = Vec::new();
        for peer in self.peers.values_mut() {
            for consumer_id in peer.close_consumers_of(producer_ids) {
                notices.push((
                    peer.sink().clone(),
                    PeerEvent::ConsumerClosed { consumer_id },
                ));
            }
        }
        notices
    }
}

fn deliver(notices: Vec<Notice>) {
    for (sink, event) in notices {
        sink.deliver(event);
    }
}

/// One session: a router plus the peers joined to it.
pub struct Room {
    id: RoomId,
    worker_id: WorkerId,
    created_at: DateTime<Utc>,
    settings: Arc<RoomSettings>,
    router_rx: watch::Receiver<RouterState>,
    state: Mutex<RoomState>,
    /// Only set while `state` is locked; readable without it.
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl Room {
    /// Create a room on `worker` and start acquiring its router.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create(
        id: RoomId,
        worker: Arc<dyn MediaWorker>,
        settings: Arc<RoomSettings>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        let (router_tx, router_rx) = watch::channel(RouterState::Pending);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let room = Arc::new(Self {
            id: id.clone(),
            worker_id: worker.id().clone(),
            created_at: Utc::now(),
            settings: Arc::clone(&settings),
            router_rx,
            state: Mutex::new(RoomState {
                peers: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
            cancel_token: cancel_token.clone(),
        });

        tokio::spawn(acquire_router(
            id,
            worker,
            settings.media_codecs.clone(),
            events_tx,
            router_tx,
            cancel_token.clone(),
        ));
        tokio::spawn(drain_engine_events(
            Arc::downgrade(&room),
            events_rx,
            cancel_token,
        ));

        room
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wait until the router is ready, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// - `RcError::RouterInitTimeout` once the bound elapses, never earlier
    /// - `RcError::Engine` if router acquisition failed
    pub async fn wait_for_router_ready(&self) -> Result<Arc<dyn MediaRouter>, RcError> {
        let started = Instant::now();
        let mut rx = self.router_rx.clone();

        let outcome = tokio::time::timeout(self.settings.router_ready_timeout, async move {
            rx.wait_for(|state| !matches!(state, RouterState::Pending))
                .await
                .map(|state| match &*state {
                    RouterState::Ready(router) => Ok(Arc::clone(router)),
                    RouterState::Failed(reason) => Err(reason.clone()),
                    RouterState::Pending => Err("router still pending".to_string()),
                })
        })
        .await;

        match outcome {
            Ok(Ok(Ok(router))) => {
                metrics::record_router_wait("ready", started.elapsed());
                Ok(router)
            }
            Ok(Ok(Err(reason))) => {
                metrics::record_router_wait("failed", started.elapsed());
                Err(RcError::Engine(format!("router unavailable: {reason}")))
            }
            Ok(Err(_)) => {
                metrics::record_router_wait("failed", started.elapsed());
                Err(RcError::Engine("router acquisition abandoned".to_string()))
            }
            Err(_) => {
                metrics::record_router_wait("timeout", started.elapsed());
                warn!(
                    target: "rc.room",
                    room_id = %self.id,
                    timeout_ms = u64::try_from(self.settings.router_ready_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "Router initialization timeout"
                );
                Err(RcError::RouterInitTimeout(self.id.clone()))
            }
        }
    }

    /// Router RTP capabilities, once the router is ready.
    pub async fn rtp_capabilities(&self) -> Result<Value, RcError> {
        Ok(self.wait_for_router_ready().await?.rtp_capabilities())
    }

    /// Add a peer.
    ///
    /// # Errors
    ///
    /// `RcError::AlreadyExists` if a peer with the same id is present;
    /// `RcError::RoomNotFound` if the room is closed.
    pub async fn add_peer(&self, peer: Peer) -> Result<(), RcError> {
        let mut state = self.state.lock().await;
        self.ensure_open()?;
        if state.peers.contains_key(peer.id()) {
            return Err(RcError::AlreadyExists(format!("peer {}", peer.id())));
        }

        info!(
            target: "rc.room",
            room_id = %self.id,
            peer_id = %peer.id(),
            name = %peer.display_name(),
            peers = state.peers.len() + 1,
            "Peer joined"
        );
        metrics::peer_joined();
        state.peers.insert(peer.id().clone(), peer);
        Ok(())
    }

    /// Remove a peer, closing everything it owns and every consumer of its
    /// producers. Returns `false` if the peer was not present.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut peer) = state.peers.remove(peer_id) else {
            debug!(target: "rc.room", room_id = %self.id, peer_id = %peer_id, "Peer already removed");
            return false;
        };

        let closed_producers = peer.close();
        let notices = state.close_downstream(&closed_producers);
        let remaining = state.peers.len();
        drop(state);

        metrics::peer_left();
        info!(
            target: "rc.room",
            room_id = %self.id,
            peer_id = %peer_id,
            producers_closed = closed_producers.len(),
            consumers_closed = notices.len(),
            remaining,
            "Peer removed"
        );
        deliver(notices);
        true
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Close the room if it has no peers. Returns `true` if the room is
    /// closed afterwards.
    pub async fn close_if_empty(&self) -> bool {
        let state = self.state.lock().await;
        if self.is_closed() {
            return true;
        }
        if !state.peers.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::SeqCst);
        drop(state);

        self.shutdown_router();
        true
    }

    /// Close every peer and the router. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<Peer> = state.peers.drain().map(|(_, peer)| peer).collect();
        drop(state);

        for mut peer in peers {
            peer.close();
            metrics::peer_left();
        }
        self.shutdown_router();
        info!(
            target: "rc.room",
            room_id = %self.id,
            age_secs = (Utc::now() - self.created_at).num_seconds(),
            "Room closed"
        );
    }

    fn shutdown_router(&self) {
        self.cancel_token.cancel();
        if let RouterState::Ready(router) = &*self.router_rx.borrow() {
            router.close();
        }
    }

    /// Whether the room has been closed. Never waits on the room lock.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RcError> {
        if self.is_closed() {
            return Err(RcError::RoomNotFound(self.id.clone()));
        }
        Ok(())
    }

    /// Create a WebRTC transport for a peer.
    #[instrument(skip_all, name = "rc.room.create_transport", fields(room_id = %self.id, peer_id = %peer_id))]
    pub async fn create_webrtc_transport(&self, peer_id: &PeerId) -> Result<TransportParams, RcError> {
        let router = self.wait_for_router_ready().await?;
        {
            let state = self.state.lock().await;
            self.ensure_open()?;
            if !state.peers.contains_key(peer_id) {
                return Err(RcError::PeerNotFound(peer_id.clone()));
            }
        }

        let transport = router
            .create_webrtc_transport(&self.settings.transport_options)
            .await?;

        if let Some(bitrate) = self.settings.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!(
                    target: "rc.room",
                    transport_id = %transport.id(),
                    error = %e,
                    "Failed to apply max incoming bitrate"
                );
            }
        }

        let params = transport.params();
        let mut state = self.state.lock().await;
        if self.is_closed() {
            transport.close();
            return Err(RcError::RoomNotFound(self.id.clone()));
        }
        let Some(peer) = state.peers.get_mut(peer_id) else {
            // Peer left while the transport was being created.
            transport.close();
            return Err(RcError::PeerNotFound(peer_id.clone()));
        };
        peer.add_transport(transport);

        debug!(target: "rc.room", transport_id = %params.id, "Transport created");
        Ok(params)
    }

    /// Connect a peer's transport. Absent peers and transports are ignored.
    pub async fn connect_peer_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<(), RcError> {
        let transport = {
            let state = self.state.lock().await;
            let Some(peer) = state.peers.get(peer_id) else {
                warn!(
                    target: "rc.room",
                    room_id = %self.id,
                    peer_id = %peer_id,
                    "connectTransport for absent peer, ignoring"
                );
                return Ok(());
            };
            let Ok(transport) = peer.transport(transport_id) else {
                warn!(
                    target: "rc.room",
                    room_id = %self.id,
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    "connectTransport for absent transport, ignoring"
                );
                return Ok(());
            };
            transport
        };

        transport.connect(dtls_parameters).await?;
        Ok(())
    }

    /// Publish media from a peer and announce it to every other peer.
    #[instrument(skip_all, name = "rc.room.produce", fields(room_id = %self.id, peer_id = %peer_id, kind = %kind))]
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: Value,
        source: Option<MediaSource>,
    ) -> Result<ProducerId, RcError> {
        let source = source.unwrap_or(MediaSource::from_kind(kind));

        let transport = {
            let state = self.state.lock().await;
            self.ensure_open()?;
            let peer = state
                .peers
                .get(peer_id)
                .ok_or_else(|| RcError::PeerNotFound(peer_id.clone()))?;
            peer.transport(transport_id)?
        };

        let producer = transport.produce(kind, rtp_parameters).await?;

        let mut state = self.state.lock().await;
        let peer = match self.live_peer(&mut state, peer_id, transport_id) {
            Ok(peer) => peer,
            Err(e) => {
                producer.close();
                return Err(e);
            }
        };
        peer.add_producer(Arc::clone(&producer), source, transport_id);
        let info = ProducerInfo {
            producer_id: producer.id().clone(),
            producer_socket_id: peer.id().clone(),
            producer_name: peer.display_name().to_string(),
            kind,
            source,
        };
        let sinks = state.sinks_except(peer_id);
        drop(state);

        metrics::record_producer_created(kind.as_str());
        info!(
            target: "rc.room",
            producer_id = %info.producer_id,
            source = source.as_str(),
            "Producer created"
        );

        for sink in sinks {
            sink.deliver(PeerEvent::NewProducers(vec![info.clone()]));
        }
        Ok(info.producer_id)
    }

    /// Create a paused consumer of `producer_id` for a peer.
    ///
    /// The consumer is committed only if the producer is still open once the
    /// engine returns; a producer closed meanwhile yields
    /// `RcError::ProducerNotFound` and the new consumer is closed.
    #[instrument(skip_all, name = "rc.room.consume", fields(room_id = %self.id, peer_id = %peer_id, producer_id = %producer_id))]
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParams, RcError> {
        let router = self.wait_for_router_ready().await?;

        let transport = {
            let state = self.state.lock().await;
            self.ensure_open()?;
            let peer = state
                .peers
                .get(peer_id)
                .ok_or_else(|| RcError::PeerNotFound(peer_id.clone()))?;
            if !state.peers.values().any(|p| p.owns_producer(producer_id)) {
                return Err(RcError::ProducerNotFound(producer_id.clone()));
            }
            if !router.can_consume(producer_id, &rtp_capabilities) {
                warn!(target: "rc.room", producer_id = %producer_id, "Cannot consume");
                return Err(RcError::IncompatibleCapabilities(producer_id.clone()));
            }
            peer.transport(transport_id)?
        };

        let consumer = transport
            .consume(producer_id, rtp_capabilities, true)
            .await?;

        let mut state = self.state.lock().await;
        let producer_open = state.peers.values().any(|p| p.owns_producer(producer_id));
        let committed = match self.live_peer(&mut state, peer_id, transport_id) {
            Ok(_) if !producer_open => Err(RcError::ProducerNotFound(producer_id.clone())),
            Ok(peer) => {
                peer.add_consumer(Arc::clone(&consumer), transport_id);
                Ok(())
            }
            Err(e) => Err(e),
        };
        drop(state);
        if let Err(e) = committed {
            debug!(
                target: "rc.room",
                consumer_id = %consumer.id(),
                error = %e,
                "Discarding consumer created during teardown"
            );
            consumer.close();
            return Err(e);
        }

        metrics::record_consumer_created(consumer.kind().as_str());
        info!(target: "rc.room", consumer_id = %consumer.id(), "Consumer created");
        Ok(ConsumerParams::from_consumer(consumer.as_ref()))
    }

    pub async fn resume_consumer(
        &self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<(), RcError> {
        let consumer = {
            let state = self.state.lock().await;
            self.ensure_open()?;
            let peer = state
                .peers
                .get(peer_id)
                .ok_or_else(|| RcError::PeerNotFound(peer_id.clone()))?;
            peer.consumer(consumer_id)?
        };
        consumer.resume().await?;
        Ok(())
    }

    /// The peer an engine object is about to be committed to, provided the
    /// room is open and the peer still holds `transport_id`.
    fn live_peer<'a>(
        &self,
        state: &'a mut RoomState,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Result<&'a mut Peer, RcError> {
        self.ensure_open()?;
        let peer = state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RcError::PeerNotFound(peer_id.clone()))?;
        if !peer.has_transport(transport_id) {
            return Err(RcError::TransportNotFound(transport_id.clone()));
        }
        Ok(peer)
    }

    /// Close one of a peer's producers. Absent peers and producers are
    /// ignored.
    pub async fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) {
        let mut state = self.state.lock().await;
        let Some(peer) = state.peers.get_mut(peer_id) else {
            debug!(
                target: "rc.room",
                room_id = %self.id,
                peer_id = %peer_id,
                "closeProducer for absent peer, ignoring"
            );
            return;
        };
        if !peer.close_producer(producer_id) {
            debug!(
                target: "rc.room",
                room_id = %self.id,
                producer_id = %producer_id,
                "Producer already closed"
            );
            return;
        }

        let notices = state.close_downstream(std::slice::from_ref(producer_id));
        drop(state);

        info!(
            target: "rc.room",
            room_id = %self.id,
            producer_id = %producer_id,
            consumers_closed = notices.len(),
            "Producer closed"
        );
        deliver(notices);
    }

    /// Every open producer across all peers, ordered by peer then producer.
    pub async fn producer_list(&self) -> Vec<ProducerInfo> {
        let state = self.state.lock().await;
        let mut list: Vec<ProducerInfo> = state
            .peers
            .values()
            .flat_map(|peer| {
                peer.producers().map(|(id, kind, source)| ProducerInfo {
                    producer_id: id.clone(),
                    producer_socket_id: peer.id().clone(),
                    producer_name: peer.display_name().to_string(),
                    kind,
                    source,
                })
            })
            .collect();
        list.sort_by(|a, b| {
            a.producer_socket_id
                .cmp(&b.producer_socket_id)
                .then_with(|| a.producer_id.cmp(&b.producer_id))
        });
        list
    }

    /// Deliver `event` to every peer except `from`.
    pub async fn broadcast(&self, from: &PeerId, event: PeerEvent) {
        let sinks = self.state.lock().await.sinks_except(from);
        for sink in sinks {
            sink.deliver(event.clone());
        }
    }

    /// `{id, peers: [{id, name}]}`, peers sorted by id.
    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerSummary> = state
            .peers
            .values()
            .map(|peer| PeerSummary {
                id: peer.id().clone(),
                name: peer.display_name().to_string(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        RoomSnapshot {
            id: self.id.clone(),
            peers,
        }
    }

    /// Apply an engine-reported closure.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        let mut state = self.state.lock().await;
        let notices = match &event {
            EngineEvent::TransportClosed { transport_id } => {
                let closed = state
                    .peers
                    .values_mut()
                    .find_map(|peer| peer.close_transport(transport_id));
                match closed {
                    Some(producers) => {
                        info!(
                            target: "rc.room",
                            room_id = %self.id,
                            transport_id = %transport_id,
                            "Transport closed by engine"
                        );
                        state.close_downstream(&producers)
                    }
                    None => Vec::new(),
                }
            }
            EngineEvent::ProducerClosed { producer_id } => {
                let closed = state
                    .peers
                    .values_mut()
                    .any(|peer| peer.close_producer(producer_id));
                if closed {
                    info!(
                        target: "rc.room",
                        room_id = %self.id,
                        producer_id = %producer_id,
                        "Producer closed by engine"
                    );
                    state.close_downstream(std::slice::from_ref(producer_id))
                } else {
                    Vec::new()
                }
            }
            EngineEvent::ConsumerClosed { consumer_id } => state
                .peers
                .values_mut()
                .find_map(|peer| {
                    peer.close_consumer(consumer_id).then(|| {
                        (
                            peer.sink().clone(),
                            PeerEvent::ConsumerClosed {
                                consumer_id: consumer_id.clone(),
                            },
                        )
                    })
                })
                .into_iter()
                .collect(),
        };
        drop(state);

        if notices.is_empty() {
            debug!(target: "rc.room", room_id = %self.id, event = ?event, "Engine event already applied");
        }
        deliver(notices);
    }
}

async fn acquire_router(
    room_id: RoomId,
    worker: Arc<dyn MediaWorker>,
    codecs: Vec<RtpCodec>,
    events: mpsc::UnboundedSender<EngineEvent>,
    router_tx: watch::Sender<RouterState>,
    cancel_token: CancellationToken,
) {
    let result = tokio::select! {
        () = cancel_token.cancelled() => {
            router_tx.send_replace(RouterState::Failed("room closed".to_string()));
            return;
        }
        result = worker.create_router(&codecs, events) => result,
    };

    match result {
        Ok(router) if cancel_token.is_cancelled() => {
            router.close();
            router_tx.send_replace(RouterState::Failed("room closed".to_string()));
        }
        Ok(router) => {
            info!(
                target: "rc.room",
                room_id = %room_id,
                router_id = %router.id(),
                worker_id = %worker.id(),
                "Router ready"
            );
            router_tx.send_replace(RouterState::Ready(router));
        }
        Err(e) => {
            error!(target: "rc.room", room_id = %room_id, error = %e, "Router creation failed");
            router_tx.send_replace(RouterState::Failed(e.to_string()));
        }
    }
}

async fn drain_engine_events(
    room: Weak<Room>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(room) = room.upgrade() else {
            break;
        };
        room.handle_engine_event(event).await;
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::media::{LoopbackEngine, LoopbackOptions, MediaEngine, WorkerSettings};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn settings(timeout: Duration) -> Arc<RoomSettings> {
        Arc::new(RoomSettings {
            media_codecs: crate::config::default_media_codecs(),
            transport_options: WebRtcTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
            },
            max_incoming_bitrate: Some(1_500_000),
            router_ready_timeout: timeout,
        })
    }

    async fn room_with(engine: &LoopbackEngine, timeout: Duration) -> Arc<Room> {
        let worker = engine
            .create_worker(&WorkerSettings {
                log_level: "warn".to_string(),
                rtc_min_port: 10000,
                rtc_max_port: 10100,
            })
            .await
            .unwrap();
        Room::create(
            RoomId::from("R1"),
            worker,
            settings(timeout),
            CancellationToken::new(),
        )
    }

    async fn join(room: &Room, id: &str) -> mpsc::Receiver<PeerEvent> {
        let (tx, rx) = mpsc::channel(16);
        let peer_id = PeerId::from(id);
        room.add_peer(Peer::new(peer_id.clone(), id, EventSink::new(peer_id, tx)))
            .await
            .unwrap();
        rx
    }

    fn caps() -> Value {
        json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}, {"kind": "video", "mimeType": "video/VP8"}]})
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx = join(&room, "a").await;

        let (tx, _rx2) = mpsc::channel(1);
        let result = room
            .add_peer(Peer::new(PeerId::from("a"), "again", EventSink::new(PeerId::from("a"), tx)))
            .await;
        assert!(matches!(result, Err(RcError::AlreadyExists(_))));
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_wait_times_out_only_after_bound() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            router_delay: Duration::from_secs(60),
            ..Default::default()
        });
        let room = room_with(&engine, Duration::from_secs(10)).await;

        let started = tokio::time::Instant::now();
        let result = room.wait_for_router_ready().await;
        assert!(matches!(result, Err(RcError::RouterInitTimeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_waiters_released_by_one_completion() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            router_delay: Duration::from_secs(3),
            ..Default::default()
        });
        let room = room_with(&engine, Duration::from_secs(10)).await;

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let room = Arc::clone(&room);
                tokio::spawn(async move { room.wait_for_router_ready().await.map(|r| r.id().clone()) })
            })
            .collect();

        let mut ids = Vec::new();
        for waiter in waiters {
            ids.push(waiter.await.unwrap().unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "One router for every waiter");
    }

    #[tokio::test]
    async fn test_router_failure_ends_wait_immediately() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            fail_router_creation: true,
            ..Default::default()
        });
        let room = room_with(&engine, Duration::from_secs(3600)).await;

        let result = room.wait_for_router_ready().await;
        assert!(matches!(result, Err(RcError::Engine(_))));
    }

    #[tokio::test]
    async fn test_create_transport_requires_peer() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;

        let result = room.create_webrtc_transport(&PeerId::from("ghost")).await;
        assert!(matches!(result, Err(RcError::PeerNotFound(_))));
        assert_eq!(engine.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_produce_announces_to_other_peers_only() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let mut rx_a = join(&room, "a").await;
        let mut rx_b = join(&room, "b").await;
        let a = PeerId::from("a");

        let transport = room.create_webrtc_transport(&a).await.unwrap();
        let producer_id = room
            .produce(&a, &transport.id, MediaKind::Video, json!({}), None)
            .await
            .unwrap();

        match rx_b.try_recv().unwrap() {
            PeerEvent::NewProducers(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].producer_id, producer_id);
                assert_eq!(list[0].producer_socket_id, a);
                assert_eq!(list[0].source, MediaSource::Video);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_consume_after_close_producer_fails() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx_a = join(&room, "a").await;
        let _rx_b = join(&room, "b").await;
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));

        let send = room.create_webrtc_transport(&a).await.unwrap();
        let recv = room.create_webrtc_transport(&b).await.unwrap();
        let producer_id = room
            .produce(&a, &send.id, MediaKind::Audio, json!({}), None)
            .await
            .unwrap();

        room.close_producer(&a, &producer_id).await;
        room.close_producer(&a, &producer_id).await;

        let result = room.consume(&b, &recv.id, &producer_id, caps()).await;
        assert!(matches!(result, Err(RcError::ProducerNotFound(_))));
        assert!(room.producer_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_incompatible_capabilities() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx_a = join(&room, "a").await;
        let _rx_b = join(&room, "b").await;
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));

        let send = room.create_webrtc_transport(&a).await.unwrap();
        let recv = room.create_webrtc_transport(&b).await.unwrap();
        let producer_id = room
            .produce(&a, &send.id, MediaKind::Video, json!({}), None)
            .await
            .unwrap();

        let audio_only = json!({"codecs": [{"kind": "audio"}]});
        let result = room.consume(&b, &recv.id, &producer_id, audio_only).await;
        assert!(matches!(result, Err(RcError::IncompatibleCapabilities(_))));
    }

    #[tokio::test]
    async fn test_remove_peer_cascades_to_consumers() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx_a = join(&room, "a").await;
        let mut rx_b = join(&room, "b").await;
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));

        let send = room.create_webrtc_transport(&a).await.unwrap();
        let recv = room.create_webrtc_transport(&b).await.unwrap();
        let producer_id = room
            .produce(&a, &send.id, MediaKind::Video, json!({}), None)
            .await
            .unwrap();
        let _ = rx_b.try_recv();
        let consumer = room
            .consume(&b, &recv.id, &producer_id, caps())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.consumer_type, "simple");

        assert!(room.remove_peer(&a).await);
        assert!(!room.remove_peer(&a).await);

        assert_eq!(
            rx_b.try_recv().unwrap(),
            PeerEvent::ConsumerClosed {
                consumer_id: consumer.id.clone()
            }
        );
        assert!(room.producer_list().await.is_empty());
        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_consumers(), 0);
    }

    #[tokio::test]
    async fn test_engine_transport_close_cascades() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx_a = join(&room, "a").await;
        let mut rx_b = join(&room, "b").await;
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));

        let send = room.create_webrtc_transport(&a).await.unwrap();
        let recv = room.create_webrtc_transport(&b).await.unwrap();
        let producer_id = room
            .produce(&a, &send.id, MediaKind::Audio, json!({}), None)
            .await
            .unwrap();
        let _ = rx_b.try_recv();
        let consumer = room
            .consume(&b, &recv.id, &producer_id, caps())
            .await
            .unwrap();

        assert!(engine.close_transport_remote(&send.id));

        let event = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PeerEvent::ConsumerClosed {
                consumer_id: consumer.id.clone()
            }
        );
        assert!(room.producer_list().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_sorted_and_close_if_empty() {
        let engine = LoopbackEngine::default();
        let room = room_with(&engine, Duration::from_secs(1)).await;
        let _rx_b = join(&room, "b").await;
        let _rx_a = join(&room, "a").await;

        let snapshot = room.snapshot().await;
        assert_eq!(snapshot.id, RoomId::from("R1"));
        let ids: Vec<_> = snapshot.peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(!room.close_if_empty().await);
        room.remove_peer(&PeerId::from("a")).await;
        room.remove_peer(&PeerId::from("b")).await;
        assert!(room.close_if_empty().await);
        assert!(room.is_closed());

        let (tx, _rx) = mpsc::channel(1);
        let late = room
            .add_peer(Peer::new(PeerId::from("c"), "c", EventSink::new(PeerId::from("c"), tx)))
            .await;
        assert!(matches!(late, Err(RcError::RoomNotFound(_))));
    }

    fn slow_engine(delay: Duration) -> LoopbackEngine {
        LoopbackEngine::new(LoopbackOptions {
            call_delay: delay,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_in_flight_leaves_room_usable() {
        let engine = slow_engine(Duration::from_secs(30));
        let room = room_with(&engine, Duration::from_secs(60)).await;
        let _rx_a = join(&room, "a").await;
        let _rx_b = join(&room, "b").await;
        let a = PeerId::from("a");
        let transport = room.create_webrtc_transport(&a).await.unwrap();

        let connecting = {
            let room = Arc::clone(&room);
            let a = a.clone();
            tokio::spawn(async move {
                room.connect_peer_transport(&a, &transport.id, json!({"role": "client"}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = tokio::time::timeout(Duration::from_secs(1), room.snapshot())
            .await
            .expect("room lock is free while the engine connects");
        assert_eq!(snapshot.peers.len(), 2);
        assert!(tokio::time::timeout(Duration::from_secs(1), room.remove_peer(&PeerId::from("b")))
            .await
            .unwrap());

        connecting.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_leaving_during_transport_creation() {
        let engine = slow_engine(Duration::from_secs(5));
        let room = room_with(&engine, Duration::from_secs(60)).await;
        let _rx_a = join(&room, "a").await;
        let a = PeerId::from("a");

        let creating = {
            let room = Arc::clone(&room);
            let a = a.clone();
            tokio::spawn(async move { room.create_webrtc_transport(&a).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.open_transports(), 1);
        assert!(room.remove_peer(&a).await);

        let result = creating.await.unwrap();
        assert!(matches!(result, Err(RcError::PeerNotFound(_))));
        assert_eq!(engine.open_transports(), 0);
    }

    /// Room with peers `a` and `b`, one transport each and one audio
    /// producer owned by `a`. Returns `(b's transport, producer)`.
    async fn producing_room(room: &Room) -> (TransportId, ProducerId) {
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));
        let send = room.create_webrtc_transport(&a).await.unwrap();
        let recv = room.create_webrtc_transport(&b).await.unwrap();
        let producer_id = room
            .produce(&a, &send.id, MediaKind::Audio, json!({}), None)
            .await
            .unwrap();
        (recv.id, producer_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_closed_during_consume() {
        let engine = slow_engine(Duration::from_secs(5));
        let room = room_with(&engine, Duration::from_secs(60)).await;
        let _rx_a = join(&room, "a").await;
        let mut rx_b = join(&room, "b").await;
        let (recv, producer_id) = producing_room(&room).await;
        assert!(matches!(rx_b.try_recv(), Ok(PeerEvent::NewProducers(_))));

        let consuming = {
            let room = Arc::clone(&room);
            let producer_id = producer_id.clone();
            tokio::spawn(async move {
                room.consume(&PeerId::from("b"), &recv, &producer_id, caps())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.open_consumers(), 1);
        room.close_producer(&PeerId::from("a"), &producer_id).await;

        let result = consuming.await.unwrap();
        assert!(matches!(result, Err(RcError::ProducerNotFound(_))));
        assert_eq!(engine.open_consumers(), 0);
        assert_eq!(engine.open_producers(), 0);

        // The discarded consumer was never announced to its would-be owner.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_leaving_during_consume() {
        let engine = slow_engine(Duration::from_secs(5));
        let room = room_with(&engine, Duration::from_secs(60)).await;
        let _rx_a = join(&room, "a").await;
        let _rx_b = join(&room, "b").await;
        let (recv, producer_id) = producing_room(&room).await;

        let consuming = {
            let room = Arc::clone(&room);
            let producer_id = producer_id.clone();
            tokio::spawn(async move {
                room.consume(&PeerId::from("b"), &recv, &producer_id, caps())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(room.remove_peer(&PeerId::from("b")).await);

        let result = consuming.await.unwrap();
        assert!(matches!(result, Err(RcError::PeerNotFound(_))));
        assert_eq!(engine.open_consumers(), 0);
        assert_eq!(engine.open_producers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_closed_during_produce() {
        let engine = slow_engine(Duration::from_secs(5));
        let room = room_with(&engine, Duration::from_secs(60)).await;
        let _rx_a = join(&room, "a").await;
        let a = PeerId::from("a");
        let send = room.create_webrtc_transport(&a).await.unwrap();

        let producing = {
            let room = Arc::clone(&room);
            tokio::spawn(async move {
                room.produce(&a, &send.id, MediaKind::Video, json!({}), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        room.close().await;

        let result = producing.await.unwrap();
        assert!(matches!(result, Err(RcError::RoomNotFound(_))));
        assert_eq!(engine.open_producers(), 0);
        assert_eq!(engine.open_transports(), 0);
    }

    #[test]
    fn test_peer_event_wire_format() {
        let event = PeerEvent::ConsumerClosed {
            consumer_id: ConsumerId::from("c-1"),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "consumerClosed", "data": {"consumer_id": "c-1"}})
        );

        let params = ConsumerParams {
            producer_id: ProducerId::from("p"),
            id: ConsumerId::from("c"),
            kind: MediaKind::Audio,
            rtp_parameters: json!({}),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["type"], "simple");
        assert_eq!(value["producerId"], "p");
        assert_eq!(value["producerPaused"], false);
    }
}
