//! `ConnectionActor` - per-signaling-connection actor.
//!
//! Each `ConnectionActor`:
//! - Owns the dispatch [`Session`] of exactly one client connection
//! - Processes that client's frames one at a time, in arrival order
//! - Writes responses and room events to the connection's outbound queue
//!
//! # Lifecycle
//!
//! 1. Spawned by the signaling server when a socket is upgraded
//! 2. Runs until the socket closes, the outbound queue closes, or the
//!    token is cancelled
//! 3. On exit runs `disconnect` cleanup, so the peer leaves its room and an
//!    emptied room is removed
//!
//! Room events reach the client through a bounded queue drained by a
//! forwarder task; a slow client loses events rather than stalling the room.

use crate::errors::RcError;
use crate::room::{EventSink, PeerEvent};
use crate::signaling::{Session, SignalingDispatcher};

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 64;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &PeerId {
        &self.connection_id
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    /// Hand a client frame to the actor. Waits for mailbox space.
    pub async fn send_frame(&self, text: String) -> Result<(), RcError> {
        self.send(ConnectionMessage::Frame { text }).await
    }

    /// Ping the actor to check liveness.
    pub async fn ping(&self) -> Result<(), RcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(ConnectionMessage::Ping { respond_to: tx }).await?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    /// Ask the actor to run disconnect cleanup and stop.
    pub async fn close(&self, reason: impl Into<String>) -> Result<(), RcError> {
        self.send(ConnectionMessage::Close {
            reason: reason.into(),
        })
        .await
    }

    async fn send(&self, message: ConnectionMessage) -> Result<(), RcError> {
        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(message).await {
            self.mailbox.record_drop();
            return Err(RcError::Internal(format!("channel send failed: {e}")));
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: PeerId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Responses and encoded events for the client.
    outbound: mpsc::Sender<String>,
    session: Session,
    dispatcher: SignalingDispatcher,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a connection actor and its event forwarder.
    ///
    /// `event_buffer` bounds the queue of room events not yet written to
    /// `outbound`.
    pub fn spawn(
        connection_id: PeerId,
        dispatcher: SignalingDispatcher,
        outbound: mpsc::Sender<String>,
        event_buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));

        tokio::spawn(forward_events(
            connection_id.clone(),
            events_rx,
            outbound.clone(),
            cancel_token.clone(),
        ));

        metrics.connection_opened();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.as_str(),
        ));
        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            outbound,
            session: Session::new(
                connection_id.clone(),
                EventSink::new(connection_id.clone(), events_tx),
            ),
            dispatcher,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rc.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break "cancelled".to_string(),

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break "channel closed".to_string();
                    };
                    self.mailbox.record_dequeue();
                    let exit = self.handle_message(message).await;
                    self.metrics.record_message_processed();

                    if let Some(reason) = exit {
                        break reason;
                    }
                }
            }
        };

        self.dispatcher.disconnect(&mut self.session).await;
        // Stops the forwarder.
        self.cancel_token.cancel();
        self.metrics.connection_closed();

        info!(
            target: "rc.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns the exit reason if the actor should
    /// stop.
    async fn handle_message(&mut self, message: ConnectionMessage) -> Option<String> {
        match message {
            ConnectionMessage::Frame { text } => {
                let response = self.dispatcher.handle_frame(&mut self.session, &text).await;
                if let Some(response) = response {
                    if self.outbound.send(response).await.is_err() {
                        return Some("outbound closed".to_string());
                    }
                }
                None
            }

            ConnectionMessage::Ping { respond_to } => {
                let _ = respond_to.send(());
                None
            }

            ConnectionMessage::Close { reason } => Some(reason),
        }
    }
}

async fn forward_events(
    connection_id: PeerId,
    mut events: mpsc::Receiver<PeerEvent>,
    outbound: mpsc::Sender<String>,
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

        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "rc.actor.connection",
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to encode event"
                );
                continue;
            }
        };
        if outbound.send(text).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{MailboxLevel, RoomRegistryHandle};
    use crate::media::{LoopbackEngine, WebRtcTransportOptions, WorkerSettings};
    use crate::room::RoomSettings;
    use crate::workers::WorkerPool;
    use serde_json::{json, Value};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    async fn dispatcher() -> SignalingDispatcher {
        let pool = WorkerPool::spawn(
            &LoopbackEngine::default(),
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
                enable_tcp: false,
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

    fn spawn(
        id: &str,
        dispatcher: SignalingDispatcher,
        token: CancellationToken,
    ) -> (ConnectionActorHandle, JoinHandle<()>, mpsc::Receiver<String>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (handle, task) = ConnectionActor::spawn(
            PeerId::from(id),
            dispatcher,
            out_tx,
            8,
            token,
            ActorMetrics::new(),
        );
        (handle, task, out_rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_frames_answered_in_order() {
        let (handle, _task, mut out) = spawn("c1", dispatcher().await, CancellationToken::new());
        assert_eq!(handle.connection_id().as_str(), "c1");

        handle
            .send_frame(json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}}).to_string())
            .await
            .unwrap();
        handle
            .send_frame(json!({"id": 2, "method": "createRoom", "data": {"room_id": "R1"}}).to_string())
            .await
            .unwrap();

        let first = next_frame(&mut out).await;
        assert_eq!(first["id"], 1);
        assert_eq!(first["ok"], true);
        let second = next_frame(&mut out).await;
        assert_eq!(second["id"], 2);
        assert_eq!(second["error"]["code"], "already_exists");

        handle.ping().await.unwrap();
        handle.cancel();
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (handle, _task, mut out) = spawn("c1", dispatcher().await, CancellationToken::new());

        handle
            .send_frame(json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}}).to_string())
            .await
            .unwrap();
        handle
            .send_frame(json!({"id": 2, "method": "join", "data": {"room_id": "R1", "name": "a"}}).to_string())
            .await
            .unwrap();
        handle
            .send_frame(json!({"method": "getProducers"}).to_string())
            .await
            .unwrap();

        next_frame(&mut out).await;
        next_frame(&mut out).await;
        let event = next_frame(&mut out).await;
        assert_eq!(event, json!({"event": "newProducers", "data": []}));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_runs_disconnect_cleanup() {
        let dispatcher = dispatcher().await;
        let registry = dispatcher.registry().clone();
        let (handle, task, mut out) = spawn("c1", dispatcher, CancellationToken::new());

        handle
            .send_frame(json!({"id": 1, "method": "createRoom", "data": {"room_id": "R1"}}).to_string())
            .await
            .unwrap();
        handle
            .send_frame(json!({"id": 2, "method": "join", "data": {"room_id": "R1", "name": "a"}}).to_string())
            .await
            .unwrap();
        next_frame(&mut out).await;
        next_frame(&mut out).await;

        handle.close("socket closed").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.get_status().await.unwrap().room_count, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_actor() {
        let parent = CancellationToken::new();
        let (handle, task, _out) = spawn("c1", dispatcher().await, parent.child_token());

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_backlog() {
        // Nobody reads the outbound queue, so the actor stalls on its second reply.
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (handle, _task) = ConnectionActor::spawn(
            PeerId::from("c1"),
            dispatcher().await,
            out_tx,
            8,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        for id in 0..20 {
            handle
                .send_frame(json!({"id": id, "method": "getMyRoomInfo"}).to_string())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mailbox = handle.mailbox();
        assert_eq!(mailbox.current_depth(), 18);
        assert!(mailbox.peak_depth() >= 18);
        assert_eq!(mailbox.current_level(), MailboxLevel::Warning);
        assert_eq!(mailbox.messages_processed(), 2);
    }

    #[tokio::test]
    async fn test_send_to_stopped_actor_counts_drop() {
        let (handle, task, _out) = spawn("c1", dispatcher().await, CancellationToken::new());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(handle.send_frame("{}".to_string()).await.is_err());
        assert!(handle.ping().await.is_err());
        assert_eq!(handle.mailbox().messages_dropped(), 2);
        assert_eq!(handle.mailbox().current_depth(), 0);
    }
}
