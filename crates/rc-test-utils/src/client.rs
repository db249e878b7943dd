//! Signaling client driving a connection actor directly.
//!
//! Requests carry increasing ids; frames arriving while a response is awaited
//! that carry an `event` key are buffered and handed out by
//! [`TestClient::next_event`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::types::PeerId;
use room_controller::actors::{ActorMetrics, ConnectionActor, ConnectionActorHandle};
use room_controller::signaling::SignalingDispatcher;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to wait for a response or event before failing the test.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// RTP capabilities accepting both audio and video.
#[must_use]
pub fn client_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
        ],
        "headerExtensions": []
    })
}

/// One end of a signaling connection.
pub struct TestClient {
    handle: ConnectionActorHandle,
    task: Option<JoinHandle<()>>,
    outbound: mpsc::Receiver<String>,
    events: VecDeque<Value>,
    next_id: u64,
}

impl TestClient {
    /// Spawn a connection actor and attach a client to it.
    #[must_use]
    pub fn spawn(
        connection_id: &str,
        dispatcher: SignalingDispatcher,
        event_buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(event_buffer.max(1) * 2);
        let (handle, task) = ConnectionActor::spawn(
            PeerId::from(connection_id),
            dispatcher,
            out_tx,
            event_buffer,
            cancel_token,
            metrics,
        );
        Self {
            handle,
            task: Some(task),
            outbound: out_rx,
            events: VecDeque::new(),
            next_id: 0,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.handle.connection_id()
    }

    /// Send a raw text frame without waiting for anything.
    pub async fn send_raw(&self, text: &str) {
        self.handle
            .send_frame(text.to_string())
            .await
            .expect("connection actor should accept frames");
    }

    /// Send a request and return the full response frame.
    pub async fn request(&mut self, method: &str, data: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let frame = json!({"id": id, "method": method, "data": data});
        self.send_raw(&frame.to_string()).await;

        let frame = self.next_response().await;
        assert_eq!(frame["id"], id, "unexpected frame while waiting for response {id}");
        frame
    }

    /// Send a request that must succeed and return its `data`.
    pub async fn request_ok(&mut self, method: &str, data: Value) -> Value {
        let frame = self.request(method, data).await;
        assert_eq!(frame["ok"], true, "{method} failed: {frame}");
        frame["data"].clone()
    }

    /// Send a request that must fail and return its error code.
    pub async fn request_err(&mut self, method: &str, data: Value) -> String {
        let frame = self.request(method, data).await;
        assert_eq!(frame["ok"], false, "{method} unexpectedly succeeded: {frame}");
        frame["error"]["code"]
            .as_str()
            .expect("error frames carry a code")
            .to_string()
    }

    /// Send a fire-and-forget message (no id, no response).
    pub async fn notify(&self, method: &str, data: Value) {
        self.send_raw(&json!({"method": method, "data": data}).to_string())
            .await;
    }

    /// Wait until every frame sent so far has been processed.
    pub async fn sync(&self) {
        self.handle
            .ping()
            .await
            .expect("connection actor should answer pings");
    }

    /// Next response frame, buffering any events that arrive first.
    pub async fn next_response(&mut self) -> Value {
        loop {
            let frame = self.recv_frame().await;
            if frame.get("event").is_some() {
                self.events.push_back(frame);
                continue;
            }
            return frame;
        }
    }

    /// Next pushed event, waiting up to five seconds.
    pub async fn next_event(&mut self) -> Value {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            let frame = self.recv_frame().await;
            if frame.get("event").is_some() {
                return frame;
            }
            panic!("unexpected response frame while waiting for an event: {frame}");
        }
    }

    /// Next event, which must be named `name`; returns its `data`.
    pub async fn expect_event(&mut self, name: &str) -> Value {
        let event = self.next_event().await;
        assert_eq!(event["event"], name, "unexpected event: {event}");
        event["data"].clone()
    }

    /// Assert no event is pending after the given quiet period.
    pub async fn assert_no_event(&mut self, quiet: Duration) {
        if let Some(event) = self.events.front() {
            panic!("unexpected buffered event: {event}");
        }
        if let Ok(Some(frame)) = tokio::time::timeout(quiet, self.outbound.recv()).await {
            panic!("unexpected frame: {frame}");
        }
    }

    /// `join` and return the room snapshot.
    pub async fn join(&mut self, room_id: &str, name: &str) -> Value {
        self.request_ok("join", json!({"room_id": room_id, "name": name}))
            .await
    }

    /// Create and connect a WebRTC transport; returns its id.
    pub async fn open_transport(&mut self) -> String {
        let params = self.request_ok("createWebRtcTransport", json!({})).await;
        let transport_id = params["id"]
            .as_str()
            .expect("transport params carry an id")
            .to_string();
        self.request_ok(
            "connectTransport",
            json!({
                "transport_id": transport_id,
                "dtlsParameters": {"role": "client", "fingerprints": []}
            }),
        )
        .await;
        transport_id
    }

    /// Produce a track of `kind` on `transport_id`; returns the producer id.
    pub async fn produce(&mut self, transport_id: &str, kind: &str) -> String {
        let data = self
            .request_ok(
                "produce",
                json!({
                    "kind": kind,
                    "rtpParameters": {"codecs": [], "encodings": [{"ssrc": 1111}]},
                    "producerTransportId": transport_id
                }),
            )
            .await;
        data["producer_id"]
            .as_str()
            .expect("produce returns a producer id")
            .to_string()
    }

    /// Consume `producer_id` on `transport_id`; returns the consumer params.
    pub async fn consume(&mut self, transport_id: &str, producer_id: &str) -> Value {
        self.request_ok(
            "consume",
            json!({
                "consumerTransportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": client_rtp_capabilities()
            }),
        )
        .await
    }

    /// Close the connection as a transport drop would, and wait for cleanup.
    pub async fn disconnect(mut self) {
        let _ = self.handle.close("test disconnect").await;
        if let Some(task) = self.task.take() {
            task.await.expect("connection actor should not panic");
        }
    }

    async fn recv_frame(&mut self) -> Value {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_str(&text).expect("server frames are JSON")
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
