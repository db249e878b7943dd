//! Room Controller error types.
//!
//! Error types map to stable signaling error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::EngineError;
use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use thiserror::Error;

/// Room Controller error type.
///
/// Every variant maps to a wire `code` via [`RcError::error_code`]:
/// - lookups: `room_not_found`, `peer_not_found`, `producer_not_found`,
///   `transport_not_found`, `consumer_not_found`
/// - session context: `not_joined`, `already_joined`
/// - media: `router_init_timeout`, `incompatible_capabilities`,
///   `permission_or_device`, `engine_error`, `engine_fatal`
/// - everything else: `already_exists`, `invalid_message`, `draining`,
///   `internal_error`
#[derive(Debug, Error)]
pub enum RcError {
    /// Room (or peer within a room) already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Peer not found in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Producer not found in the room.
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Transport not found on the peer.
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Consumer not found on the peer.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// The room's router did not become ready within the configured bound.
    #[error("Router initialization timeout for room {0}")]
    RouterInitTimeout(RoomId),

    /// The consuming side cannot receive the producer's codecs.
    #[error("Incompatible capabilities for producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// The connection has not joined a room.
    #[error("Connection has not joined a room")]
    NotJoined,

    /// The connection is already attached to a room.
    #[error("Connection already joined room {0}")]
    AlreadyJoined(RoomId),

    /// Client-side media acquisition failed (permissions or device).
    #[error("Media permission or device error: {0}")]
    PermissionOrDevice(String),

    /// A media worker died; the process cannot continue.
    #[error("Media engine fatal: {0}")]
    EngineFatal(String),

    /// Non-fatal media engine failure.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Message failed validation at the dispatch boundary.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Controller is shutting down.
    #[error("Controller is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RcError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            RcError::AlreadyExists(_) => "already_exists",
            RcError::RoomNotFound(_) => "room_not_found",
            RcError::PeerNotFound(_) => "peer_not_found",
            RcError::ProducerNotFound(_) => "producer_not_found",
            RcError::TransportNotFound(_) => "transport_not_found",
            RcError::ConsumerNotFound(_) => "consumer_not_found",
            RcError::RouterInitTimeout(_) => "router_init_timeout",
            RcError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            RcError::NotJoined => "not_joined",
            RcError::AlreadyJoined(_) => "already_joined",
            RcError::PermissionOrDevice(_) => "permission_or_device",
            RcError::EngineFatal(_) => "engine_fatal",
            RcError::Engine(_) => "engine_error",
            RcError::InvalidMessage(_) => "invalid_message",
            RcError::Draining => "draining",
            RcError::Internal(_) => "internal_error",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RcError::AlreadyExists(_) => "already exists".to_string(),
            RcError::RoomNotFound(_) => "Room does not exist".to_string(),
            RcError::PeerNotFound(_) => "Peer not found".to_string(),
            RcError::ProducerNotFound(id) => format!("Producer {id} not found"),
            RcError::TransportNotFound(id) => format!("Transport with id {id} not found"),
            RcError::ConsumerNotFound(id) => format!("Consumer with id {id} not found"),
            RcError::RouterInitTimeout(_) => "Router initialization timeout".to_string(),
            RcError::IncompatibleCapabilities(_) => "Cannot consume".to_string(),
            RcError::NotJoined => "Not currently in a room".to_string(),
            RcError::AlreadyJoined(_) => "Already in a room".to_string(),
            RcError::PermissionOrDevice(msg) => msg.clone(),
            RcError::InvalidMessage(msg) => format!("Invalid message: {msg}"),
            RcError::Draining => "Server is shutting down, please reconnect".to_string(),
            RcError::EngineFatal(_) | RcError::Engine(_) | RcError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}

impl From<EngineError> for RcError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDied(reason) => RcError::EngineFatal(reason),
            EngineError::ProducerNotFound(id) => RcError::ProducerNotFound(id),
            other => RcError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            RcError::AlreadyExists("R1".to_string()).error_code(),
            "already_exists"
        );
        assert_eq!(
            RcError::RoomNotFound(RoomId::from("R1")).error_code(),
            "room_not_found"
        );
        assert_eq!(
            RcError::RouterInitTimeout(RoomId::from("R1")).error_code(),
            "router_init_timeout"
        );
        assert_eq!(
            RcError::IncompatibleCapabilities(ProducerId::from("p")).error_code(),
            "incompatible_capabilities"
        );
        assert_eq!(RcError::NotJoined.error_code(), "not_joined");
        assert_eq!(
            RcError::EngineFatal("worker died".to_string()).error_code(),
            "engine_fatal"
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let engine_err = RcError::Engine("pipe to worker 4711 broken".to_string());
        assert!(!engine_err.client_message().contains("4711"));
        assert_eq!(engine_err.client_message(), "An internal error occurred");

        let internal = RcError::Internal("channel send failed".to_string());
        assert_eq!(internal.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_engine_error_conversion() {
        let fatal: RcError = EngineError::WorkerDied("segfault".to_string()).into();
        assert!(matches!(fatal, RcError::EngineFatal(_)));

        let plain: RcError = EngineError::Closed("transport".to_string()).into();
        assert!(matches!(plain, RcError::Engine(_)));
        assert_eq!(plain.error_code(), "engine_error");

        let missing: RcError = EngineError::ProducerNotFound(ProducerId::from("p")).into();
        assert!(matches!(missing, RcError::ProducerNotFound(_)));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RcError::ProducerNotFound(ProducerId::from("p-1"))),
            "Producer not found: p-1"
        );
        assert_eq!(
            format!("{}", RcError::NotJoined),
            "Connection has not joined a room"
        );
    }
}
