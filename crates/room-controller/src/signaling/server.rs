//! Signaling HTTP server.
//!
//! Serves `GET /ws`. Each upgraded socket gets a [`ConnectionActor`]; the
//! socket reader feeds the actor's mailbox and a writer task drains the
//! connection's outbound queue into the socket.

use super::dispatcher::SignalingDispatcher;
use crate::actors::{ActorMetrics, ConnectionActor};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use common::types::PeerId;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Maximum accepted client frame size.
const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Shared state of the signaling endpoint.
#[derive(Clone)]
pub struct SignalingState {
    pub dispatcher: SignalingDispatcher,
    pub metrics: Arc<ActorMetrics>,
    /// Per-connection event queue bound.
    pub event_buffer: usize,
    /// Parent of every connection's token.
    pub cancel_token: CancellationToken,
}

/// Create the signaling router.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(|error| {
            warn!(target: "rc.signaling", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = PeerId::random();
    info!(target: "rc.signaling", connection_id = %connection_id, "Client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    // Responses plus events; the event queue in front of it is the bounded one
    // that drops.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.event_buffer.max(1) * 2);

    let token = state.cancel_token.child_token();
    let (handle, actor_task) = ConnectionActor::spawn(
        connection_id.clone(),
        state.dispatcher.clone(),
        out_tx,
        state.event_buffer,
        token.clone(),
        Arc::clone(&state.metrics),
    );

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reason = loop {
        let frame = tokio::select! {
            () = token.cancelled() => break "server shutdown",
            frame = ws_rx.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if handle.send_frame(text).await.is_err() {
                    break "connection actor stopped";
                }
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    "Ignoring binary frame"
                );
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break "client closed",
            Some(Err(e)) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read failed"
                );
                break "read error";
            }
        }
    };

    // Either the actor is gone already or it runs disconnect cleanup now.
    let _ = handle.close(reason).await;
    let _ = actor_task.await;
    let _ = writer.await;

    info!(
        target: "rc.signaling",
        connection_id = %connection_id,
        reason,
        "Client disconnected"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::RoomRegistryHandle;
    use crate::media::{LoopbackEngine, WebRtcTransportOptions, WorkerSettings};
    use crate::room::RoomSettings;
    use crate::workers::WorkerPool;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> Router {
        let pool = WorkerPool::spawn(
            &LoopbackEngine::default(),
            &WorkerSettings {
                log_level: "warn".to_string(),
                rtc_min_port: 10000,
                rtc_max_port: 10010,
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
        let metrics = ActorMetrics::new();
        let registry =
            RoomRegistryHandle::new(Arc::new(pool), Arc::new(settings), Arc::clone(&metrics));
        signaling_router(SignalingState {
            dispatcher: SignalingDispatcher::new(registry),
            metrics,
            event_buffer: 8,
            cancel_token: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn test_plain_get_is_not_upgraded() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
