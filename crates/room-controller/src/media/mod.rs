//! Media engine facade.
//!
//! The Room Controller never touches RTP, ICE or DTLS itself. It drives an
//! external media engine through the traits in this module: a pool of
//! workers that create routers, routers that create WebRTC transports, and
//! transports that create producers and consumers. Negotiation payloads
//! (RTP capabilities and parameters, ICE and DTLS parameters) pass through
//! as opaque JSON.
//!
//! # Lifecycle events
//!
//! Closures the engine initiates on its own (a transport whose DTLS state
//! went to `closed`, a consumer whose upstream producer vanished) are
//! reported as [`EngineEvent`] values on the channel handed to
//! [`MediaWorker::create_router`]. Closures the controller initiates are
//! cascaded synchronously by the owning room, so the engine events for those
//! arrive as no-ops.
//!
//! # Implementations
//!
//! - [`loopback::LoopbackEngine`] - in-process engine that tracks entity
//!   liveness and capability compatibility without moving media

pub mod loopback;

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use loopback::{LoopbackEngine, LoopbackOptions};

/// Errors reported by the media engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The worker process backing this entity died.
    #[error("worker died: {0}")]
    WorkerDied(String),

    /// The entity was already closed.
    #[error("{0} closed")]
    Closed(String),

    /// The referenced producer does not exist on this router.
    #[error("producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Negotiation payload rejected by the engine.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The engine could not allocate the requested resource.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Media kind as understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a producer publishes. Screen shares travel as video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Audio,
    Video,
    Screen,
}

impl MediaSource {
    /// Default source for a producer that did not declare one.
    #[must_use]
    pub const fn from_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaSource::Audio,
            MediaKind::Video => MediaSource::Video,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaSource::Audio => "audio",
            MediaSource::Video => "video",
            MediaSource::Screen => "screen",
        }
    }
}

/// One codec a router is configured to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

/// Settings used when spawning a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub log_level: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Options for a new WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Parameters the remote side needs to set up its end of a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Asynchronous lifecycle notification from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The transport closed underneath its owner (e.g. DTLS closed).
    TransportClosed { transport_id: TransportId },
    /// The producer closed underneath its owner.
    ProducerClosed { producer_id: ProducerId },
    /// The consumer closed because its upstream producer closed.
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Sending half of a router's lifecycle event channel.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Factory for media workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a new worker.
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError>;
}

/// A media-processing backend. Routers live on exactly one worker.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &WorkerId;

    /// Create a router for the given codecs. Lifecycle events for every
    /// entity created under the router are delivered on `events`.
    async fn create_router(
        &self,
        codecs: &[RtpCodec],
        events: EngineEventSender,
    ) -> Result<Arc<dyn MediaRouter>, EngineError>;

    /// Resolves with a reason once the worker has died. Never resolves for a
    /// healthy worker.
    async fn died(&self) -> String;

    fn close(&self);
}

/// Per-room routing context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &RouterId;

    /// Capability set clients load their device with.
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    fn close(&self);
}

/// One directional media channel between a client and the router.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn params(&self) -> TransportParams;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError>;

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn MediaProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError>;

    /// Close the transport and every producer and consumer on it.
    fn close(&self);
}

/// A published media stream.
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn close(&self);
}

/// A local handle receiving one upstream producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    fn consumer_type(&self) -> &str;
    fn producer_paused(&self) -> bool;
    fn paused(&self) -> bool;
    async fn resume(&self) -> Result<(), EngineError>;
    fn close(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, MediaKind::Audio);
    }

    #[test]
    fn test_source_defaults_from_kind() {
        assert_eq!(MediaSource::from_kind(MediaKind::Audio), MediaSource::Audio);
        assert_eq!(MediaSource::from_kind(MediaKind::Video), MediaSource::Video);
        assert_eq!(MediaSource::Screen.as_str(), "screen");
    }

    #[test]
    fn test_transport_params_are_camel_case() {
        let params = TransportParams {
            id: TransportId::from("t-1"),
            ice_parameters: serde_json::json!({}),
            ice_candidates: serde_json::json!([]),
            dtls_parameters: serde_json::json!({}),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("iceParameters").is_some());
        assert!(value.get("iceCandidates").is_some());
        assert!(value.get("dtlsParameters").is_some());
    }
}
