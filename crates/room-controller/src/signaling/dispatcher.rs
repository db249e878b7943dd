//! Request dispatch.
//!
//! The dispatcher maps each [`ClientRequest`] to one registry or room call
//! and turns the outcome into exactly one response. Errors never escape the
//! dispatch boundary; they become `{"ok": false, "error": ...}` frames.
//!
//! A connection is attached to at most one room for its lifetime, tracked
//! in its [`Session`]. Requests that need a room fail with `not_joined`
//! until the connection has joined one. Cleanup-adjacent messages
//! (`connectTransport`, `producerClosed`) that arrive after the room or peer
//! is gone are accepted silently.

use super::protocol::{ClientRequest, RawFrame, ResponseFrame};
use crate::actors::RoomRegistryHandle;
use crate::errors::RcError;
use crate::observability::metrics;
use crate::room::{EventSink, Peer, PeerEvent, Room};
use common::types::PeerId;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-connection dispatch state.
pub struct Session {
    connection_id: PeerId,
    sink: EventSink,
    room: Option<Arc<Room>>,
}

impl Session {
    /// New unattached session. `sink` receives the connection's events.
    #[must_use]
    pub fn new(connection_id: PeerId, sink: EventSink) -> Self {
        Self {
            connection_id,
            sink,
            room: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &PeerId {
        &self.connection_id
    }

    #[must_use]
    pub fn room(&self) -> Option<&Arc<Room>> {
        self.room.as_ref()
    }

    fn attached(&self) -> Result<&Arc<Room>, RcError> {
        self.room.as_ref().ok_or(RcError::NotJoined)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RcError> {
    serde_json::to_value(value).map_err(|e| RcError::Internal(format!("serialize failed: {e}")))
}

fn success() -> Value {
    Value::String("success".to_string())
}

/// Routes signaling requests to the registry and rooms.
#[derive(Clone, Debug)]
pub struct SignalingDispatcher {
    registry: RoomRegistryHandle,
}

impl SignalingDispatcher {
    #[must_use]
    pub fn new(registry: RoomRegistryHandle) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    /// Handle one raw text frame. Returns the encoded response, if any.
    pub async fn handle_frame(&self, session: &mut Session, text: &str) -> Option<String> {
        let frame = match RawFrame::decode(text) {
            Ok(frame) => frame,
            Err((id, err)) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %session.connection_id,
                    error = %err,
                    "Undecodable frame"
                );
                return encode(&ResponseFrame::failure(id, &err));
            }
        };

        let request = match ClientRequest::parse(&frame.method, frame.data) {
            Ok(request) => request,
            Err(err) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %session.connection_id,
                    method = %frame.method,
                    error = %err,
                    "Invalid request"
                );
                return encode(&ResponseFrame::failure(frame.id, &err));
            }
        };

        let method = request.method();
        let expects_response = request.expects_response();
        let started = Instant::now();
        let result = self.dispatch(session, request).await;
        metrics::record_message_latency(method, started.elapsed());

        if let Err(err) = &result {
            debug!(
                target: "rc.signaling",
                connection_id = %session.connection_id,
                method,
                code = err.error_code(),
                error = %err,
                "Request failed"
            );
        }
        if !expects_response {
            return None;
        }

        let response = match result {
            Ok(data) => ResponseFrame::success(frame.id, data),
            Err(err) => ResponseFrame::failure(frame.id, &err),
        };
        encode(&response)
    }

    /// Execute a validated request.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        request: ClientRequest,
    ) -> Result<Value, RcError> {
        let peer_id = session.connection_id.clone();

        match request {
            ClientRequest::CreateRoom { room_id } => {
                self.registry.create_room(room_id.clone()).await?;
                to_json(&room_id)
            }

            ClientRequest::Join { room_id, name } => {
                if let Some(room) = &session.room {
                    return Err(RcError::AlreadyJoined(room.id().clone()));
                }
                let room = self.registry.get_room(room_id).await?;
                room.add_peer(Peer::new(peer_id, name, session.sink.clone()))
                    .await?;
                let snapshot = room.snapshot().await;
                session.room = Some(room);
                to_json(&snapshot)
            }

            ClientRequest::GetProducers => {
                let room = session.attached()?;
                let producers: Vec<_> = room
                    .producer_list()
                    .await
                    .into_iter()
                    .filter(|info| info.producer_socket_id != peer_id)
                    .collect();
                session.sink.deliver(PeerEvent::NewProducers(producers));
                Ok(Value::Null)
            }

            ClientRequest::GetRouterRtpCapabilities => {
                session.attached()?.rtp_capabilities().await
            }

            ClientRequest::CreateWebRtcTransport => {
                let params = session
                    .attached()?
                    .create_webrtc_transport(&peer_id)
                    .await?;
                to_json(&params)
            }

            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                match &session.room {
                    Some(room) => {
                        room.connect_peer_transport(&peer_id, &transport_id, dtls_parameters)
                            .await?;
                    }
                    None => {
                        debug!(
                            target: "rc.signaling",
                            connection_id = %peer_id,
                            "connectTransport outside a room, ignoring"
                        );
                    }
                }
                Ok(success())
            }

            ClientRequest::Produce {
                kind,
                rtp_parameters,
                producer_transport_id,
                source,
            } => {
                let producer_id = session
                    .attached()?
                    .produce(&peer_id, &producer_transport_id, kind, rtp_parameters, source)
                    .await?;
                Ok(json!({ "producer_id": producer_id }))
            }

            ClientRequest::Consume {
                consumer_transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let params = session
                    .attached()?
                    .consume(&peer_id, &consumer_transport_id, &producer_id, rtp_capabilities)
                    .await?;
                to_json(&params)
            }

            ClientRequest::Resume { consumer_id } => {
                session
                    .attached()?
                    .resume_consumer(&peer_id, &consumer_id)
                    .await?;
                Ok(success())
            }

            ClientRequest::GetMyRoomInfo => {
                let snapshot = session.attached()?.snapshot().await;
                to_json(&snapshot)
            }

            ClientRequest::ProducerClosed { producer_id } => {
                if let Some(room) = &session.room {
                    room.close_producer(&peer_id, &producer_id).await;
                }
                Ok(Value::Null)
            }

            ClientRequest::ExitRoom => {
                session.attached()?;
                self.detach(session).await;
                Ok(success())
            }

            ClientRequest::ReportMediaError { source, message } => {
                warn!(
                    target: "rc.signaling",
                    connection_id = %peer_id,
                    source = source.as_str(),
                    message = %message,
                    "Client media acquisition failed"
                );
                if let Some(room) = &session.room {
                    room.broadcast(
                        &peer_id,
                        PeerEvent::PeerMediaError {
                            peer_id: peer_id.clone(),
                            source,
                            message: message.clone(),
                        },
                    )
                    .await;
                }
                Err(RcError::PermissionOrDevice(message))
            }
        }
    }

    /// Transport-level disconnect: same cleanup as `exitRoom`, no reply.
    pub async fn disconnect(&self, session: &mut Session) {
        if session.room.is_some() {
            info!(
                target: "rc.signaling",
                connection_id = %session.connection_id,
                "Connection dropped while in a room"
            );
        }
        self.detach(session).await;
    }

    /// Remove the session's peer and drop the room if it is now empty.
    async fn detach(&self, session: &mut Session) {
        let Some(room) = session.room.take() else {
            return;
        };

        room.remove_peer(&session.connection_id).await;
        match self.registry.delete_room_if_empty(&room).await {
            Ok(true) => {
                debug!(target: "rc.signaling", room_id = %room.id(), "Last peer left, room removed");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    target: "rc.signaling",
                    room_id = %room.id(),
                    error = %e,
                    "Failed to remove empty room"
                );
            }
        }
    }
}

fn encode(frame: &ResponseFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(target: "rc.signaling", error = %e, "Failed to encode response");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::ActorMetrics;
    use crate::media::{LoopbackEngine, WebRtcTransportOptions, WorkerSettings};
    use crate::room::RoomSettings;
    use crate::workers::WorkerPool;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn dispatcher() -> SignalingDispatcher {
        let engine = LoopbackEngine::default();
        let pool = WorkerPool::spawn(
            &engine,
            &WorkerSettings {
                log_level: "warn".to_string(),
                rtc_min_port: 10000,
                rtc_max_port: 10100,
            },
            1,
        )
        .await
        .unwrap();
        let settings = RoomSettings {
            media_codecs: crate::config::default_media_codecs(),
            transport_options: WebRtcTransportOptions {
                listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                initial_available_outgoing_bitrate: 1_000_000,
            },
            max_incoming_bitrate: None,
            router_ready_timeout: Duration::from_secs(1),
        };
        SignalingDispatcher::new(RoomRegistryHandle::new(
            Arc::new(pool),
            Arc::new(settings),
            ActorMetrics::new(),
        ))
    }

    fn session(id: &str) -> (Session, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let peer_id = PeerId::from(id);
        (Session::new(peer_id.clone(), EventSink::new(peer_id, tx)), rx)
    }

    async fn call(d: &SignalingDispatcher, s: &mut Session, frame: Value) -> Value {
        let text = d.handle_frame(s, &frame.to_string()).await.unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_requires_join() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        let reply = call(&d, &mut s, json!({"id": 1, "method": "createWebRtcTransport"})).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "not_joined");

        let reply = call(&d, &mut s, json!({"id": 2, "method": "exitRoom"})).await;
        assert_eq!(reply["error"]["code"], "not_joined");
    }

    #[tokio::test]
    async fn test_create_join_and_snapshot() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        let reply = call(&d, &mut s, json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}})).await;
        assert_eq!(reply, json!({"id": 1, "ok": true, "data": "R1"}));

        let reply = call(&d, &mut s, json!({"id": 2, "method": "join", "data": {"room_id": "R1", "name": "alice"}})).await;
        assert_eq!(reply["data"], json!({"id": "R1", "peers": [{"id": "c1", "name": "alice"}]}));

        let reply = call(&d, &mut s, json!({"id": 3, "method": "join", "data": {"room_id": "R1", "name": "alice"}})).await;
        assert_eq!(reply["error"]["code"], "already_joined");

        let reply = call(&d, &mut s, json!({"id": 4, "method": "getMyRoomInfo"})).await;
        assert_eq!(reply["data"]["id"], "R1");
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        let reply = call(&d, &mut s, json!({"id": 1, "method": "join", "data": {"room_id": "nope", "name": "x"}})).await;
        assert_eq!(reply["error"]["code"], "room_not_found");
        assert!(s.room().is_none());
    }

    #[tokio::test]
    async fn test_fire_and_forget_has_no_reply() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        let reply = d
            .handle_frame(&mut s, r#"{"method":"producerClosed","data":{"producer_id":"p"}}"#)
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_invalid_frames_rejected() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        let reply = call(&d, &mut s, json!({"id": 5, "method": "warp"})).await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], "invalid_message");

        let text = d.handle_frame(&mut s, "{oops").await.unwrap();
        let reply: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reply["error"]["code"], "invalid_message");
    }

    #[tokio::test]
    async fn test_exit_removes_empty_room() {
        let d = dispatcher().await;
        let (mut s, _rx) = session("c1");

        call(&d, &mut s, json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}})).await;
        call(&d, &mut s, json!({"id": 2, "method": "join", "data": {"room_id": "R1", "name": "a"}})).await;

        let reply = call(&d, &mut s, json!({"id": 3, "method": "exitRoom"})).await;
        assert_eq!(reply["data"], "success");
        assert!(s.room().is_none());
        assert_eq!(d.registry().get_status().await.unwrap().room_count, 0);

        // The id is free again.
        let reply = call(&d, &mut s, json!({"id": 4, "method": "createRoom", "data": {"room_id": "R1"}})).await;
        assert_eq!(reply["ok"], true);
    }

    #[tokio::test]
    async fn test_report_media_error_relays_and_echoes() {
        let d = dispatcher().await;
        let (mut a, _rx_a) = session("a");
        let (mut b, mut rx_b) = session("b");

        call(&d, &mut a, json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}})).await;
        call(&d, &mut a, json!({"id": 2, "method": "join", "data": {"room_id": "R1", "name": "a"}})).await;
        call(&d, &mut b, json!({"id": 1, "method": "join", "data": {"room_id": "R1", "name": "b"}})).await;

        let reply = call(
            &d,
            &mut a,
            json!({"id": 3, "method": "reportMediaError", "data": {"source": "video", "message": "Permission denied"}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], "permission_or_device");
        assert_eq!(reply["error"]["message"], "Permission denied");

        let event = rx_b.try_recv().unwrap();
        assert!(matches!(event, PeerEvent::PeerMediaError { ref peer_id, .. } if peer_id.as_str() == "a"));
    }
}
