//! `RoomRegistryActor` - process-wide owner of every room.
//!
//! The registry is the only place rooms are created and removed:
//!
//! - Singleton per process, injected into the signaling layer via its handle
//! - Assigns each new room the next worker from the [`WorkerPool`]
//! - Owns the root `CancellationToken` rooms derive theirs from
//!
//! A room is inserted before `createRoom` replies, so a `getRoom` issued
//! after a successful create always finds it even while its router is still
//! being acquired.
//!
//! The actor never awaits a room's lock. Emptiness checks run in the
//! caller's task, and closes triggered by the actor run in spawned tasks, so
//! one busy room cannot stall every other `createRoom` or `getRoom`. A room
//! that is closed but not yet forgotten is treated as absent.
//!
//! # Graceful Shutdown
//!
//! On shutdown the registry:
//! 1. Stops accepting rooms (`createRoom` fails with `Draining`)
//! 2. Closes every room within the deadline
//! 3. Cancels the root token

use crate::errors::RcError;
use crate::room::{Room, RoomSettings};
use crate::workers::WorkerPool;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(
        workers: Arc<WorkerPool>,
        settings: Arc<RoomSettings>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "registry"));

        let actor = RoomRegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            accepting_new: true,
            workers,
            settings,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, RcError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.record_drop();
            return Err(RcError::Internal(format!("channel send failed: {e}")));
        }

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    /// Create a room.
    ///
    /// # Errors
    ///
    /// `RcError::AlreadyExists` if the id is taken, `RcError::Draining`
    /// after shutdown began.
    pub async fn create_room(&self, room_id: RoomId) -> Result<Arc<Room>, RcError> {
        self.request(|respond_to| RegistryMessage::CreateRoom {
            room_id,
            respond_to,
        })
        .await?
    }

    /// Look up an open room.
    pub async fn get_room(&self, room_id: RoomId) -> Result<Arc<Room>, RcError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            room_id,
            respond_to,
        })
        .await?
    }

    /// Close and remove a room. Unknown ids are ignored.
    pub async fn delete_room(&self, room_id: RoomId) -> Result<(), RcError> {
        self.request(|respond_to| RegistryMessage::DeleteRoom {
            room_id,
            respond_to,
        })
        .await
    }

    /// Close and remove `room` if no peers remain. Returns `true` if the
    /// room is closed afterwards.
    ///
    /// The emptiness check takes the room's lock in the calling task; the
    /// actor only forgets the room once it is closed.
    pub async fn delete_room_if_empty(&self, room: &Arc<Room>) -> Result<bool, RcError> {
        if !room.close_if_empty().await {
            return Ok(false);
        }
        let room = Arc::clone(room);
        self.request(|respond_to| RegistryMessage::ForgetClosedRoom { room, respond_to })
            .await?;
        Ok(true)
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RcError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting rooms and close all existing ones.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RcError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    /// Child token for tasks that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `RoomRegistryActor` implementation.
struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Root token; each room gets a child.
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, Arc<Room>>,
    accepting_new: bool,
    workers: Arc<WorkerPool>,
    settings: Arc<RoomSettings>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "rc.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "rc.registry",
            workers = self.workers.len(),
            "RoomRegistryActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "rc.registry", "RoomRegistryActor received cancellation signal");
                    tokio::spawn(close_rooms(self.drain_rooms(), Duration::from_secs(5)));
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(target: "rc.registry", "RoomRegistryActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_room(room_id));
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self
                    .rooms
                    .get(&room_id)
                    .filter(|room| !room.is_closed())
                    .cloned()
                    .ok_or(RcError::RoomNotFound(room_id));
                let _ = respond_to.send(result);
            }

            RegistryMessage::DeleteRoom {
                room_id,
                respond_to,
            } => {
                let Some(room) = self.rooms.remove(&room_id) else {
                    let _ = respond_to.send(());
                    return;
                };
                self.rooms_changed();
                info!(target: "rc.registry", room_id = %room_id, "Room deleted");
                // Reply once the close completes, off the actor loop.
                tokio::spawn(async move {
                    room.close().await;
                    let _ = respond_to.send(());
                });
            }

            RegistryMessage::ForgetClosedRoom { room, respond_to } => {
                let _ = respond_to.send(self.forget_closed_room(&room));
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    accepting_new: self.accepting_new,
                });
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.accepting_new = false;
                let rooms = self.drain_rooms();
                let cancel_token = self.cancel_token.clone();
                tokio::spawn(async move {
                    close_rooms(rooms, deadline).await;
                    cancel_token.cancel();
                    let _ = respond_to.send(Ok(()));
                });
            }
        }
    }

    fn create_room(&mut self, room_id: RoomId) -> Result<Arc<Room>, RcError> {
        if !self.accepting_new {
            return Err(RcError::Draining);
        }
        if self.rooms.get(&room_id).is_some_and(|room| !room.is_closed()) {
            debug!(target: "rc.registry", room_id = %room_id, "Room already exists");
            return Err(RcError::AlreadyExists(format!("room {room_id}")));
        }

        let worker = self.workers.next_worker()?;
        let room = Room::create(
            room_id.clone(),
            worker,
            Arc::clone(&self.settings),
            self.cancel_token.child_token(),
        );
        self.rooms.insert(room_id.clone(), Arc::clone(&room));
        self.rooms_changed();

        info!(
            target: "rc.registry",
            room_id = %room_id,
            worker_id = %room.worker_id(),
            total_rooms = self.rooms.len(),
            "Room created"
        );
        Ok(room)
    }

    /// Remove `room` if it is closed and still the one registered under its
    /// id. Returns `true` if the entry was removed.
    fn forget_closed_room(&mut self, room: &Arc<Room>) -> bool {
        let registered = self
            .rooms
            .get(room.id())
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if !registered || !room.is_closed() {
            return false;
        }

        self.rooms.remove(room.id());
        self.rooms_changed();
        info!(
            target: "rc.registry",
            room_id = %room.id(),
            age_secs = (chrono::Utc::now() - room.created_at()).num_seconds(),
            "Empty room removed"
        );
        true
    }

    fn drain_rooms(&mut self) -> Vec<Arc<Room>> {
        let rooms: Vec<Arc<Room>> = self.rooms.drain().map(|(_, room)| room).collect();
        self.rooms_changed();
        rooms
    }

    fn rooms_changed(&self) {
        self.metrics.set_rooms(self.rooms.len());
    }
}

/// Close `rooms` concurrently, giving up after `deadline`.
async fn close_rooms(rooms: Vec<Arc<Room>>, deadline: Duration) {
    let count = rooms.len();
    let closing = futures::future::join_all(rooms.iter().map(|room| room.close()));

    if tokio::time::timeout(deadline, closing).await.is_err() {
        warn!(
            target: "rc.registry",
            rooms = count,
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "Room shutdown deadline exceeded"
        );
    } else {
        info!(target: "rc.registry", rooms = count, "All rooms closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{LoopbackEngine, LoopbackOptions, WebRtcTransportOptions, WorkerSettings};
    use crate::room::{EventSink, Peer};
    use common::types::PeerId;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    async fn registry(workers: usize) -> (RoomRegistryHandle, LoopbackEngine) {
        registry_on(LoopbackEngine::default(), workers).await
    }

    async fn registry_on(
        engine: LoopbackEngine,
        workers: usize,
    ) -> (RoomRegistryHandle, LoopbackEngine) {
        let pool = WorkerPool::spawn(
            &engine,
            &WorkerSettings {
                log_level: "warn".to_string(),
                rtc_min_port: 10000,
                rtc_max_port: 10100,
            },
            workers,
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
            router_ready_timeout: Duration::from_secs(60),
        };
        let handle =
            RoomRegistryHandle::new(Arc::new(pool), Arc::new(settings), ActorMetrics::new());
        (handle, engine)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (registry, _engine) = registry(1).await;

        let created = registry.create_room(RoomId::from("R1")).await.unwrap();
        let found = registry.get_room(RoomId::from("R1")).await.unwrap();
        assert!(Arc::ptr_eq(&created, &found));

        let missing = registry.get_room(RoomId::from("R2")).await;
        assert!(matches!(missing, Err(RcError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let (registry, _engine) = registry(1).await;

        registry.create_room(RoomId::from("R1")).await.unwrap();
        let second = registry.create_room(RoomId::from("R1")).await;
        assert!(matches!(second, Err(RcError::AlreadyExists(_))));
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);
    }

    #[tokio::test]
    async fn test_rooms_assigned_round_robin() {
        let (registry, _engine) = registry(2).await;

        let a = registry.create_room(RoomId::from("A")).await.unwrap();
        let b = registry.create_room(RoomId::from("B")).await.unwrap();
        let c = registry.create_room(RoomId::from("C")).await.unwrap();
        assert_ne!(a.worker_id(), b.worker_id());
        assert_eq!(a.worker_id(), c.worker_id());
    }

    #[tokio::test]
    async fn test_delete_room_is_idempotent() {
        let (registry, _engine) = registry(1).await;

        let room = registry.create_room(RoomId::from("R1")).await.unwrap();
        registry.delete_room(RoomId::from("R1")).await.unwrap();
        registry.delete_room(RoomId::from("R1")).await.unwrap();
        assert!(room.is_closed());
        assert_eq!(registry.get_status().await.unwrap().room_count, 0);
    }

    #[tokio::test]
    async fn test_delete_if_empty_keeps_occupied_room() {
        let (registry, _engine) = registry(1).await;
        let room = registry.create_room(RoomId::from("R1")).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let peer_id = PeerId::from("a");
        room.add_peer(Peer::new(peer_id.clone(), "a", EventSink::new(peer_id.clone(), tx)))
            .await
            .unwrap();

        assert!(!registry.delete_room_if_empty(&room).await.unwrap());
        assert!(registry.get_room(RoomId::from("R1")).await.is_ok());

        room.remove_peer(&peer_id).await;
        assert!(registry.delete_room_if_empty(&room).await.unwrap());
        assert!(registry.get_room(RoomId::from("R1")).await.is_err());
        assert_eq!(registry.get_status().await.unwrap().room_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let (registry, engine) = registry(1).await;
        let room = registry.create_room(RoomId::from("R1")).await.unwrap();
        room.wait_for_router_ready().await.unwrap();

        registry.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(room.is_closed());
        assert!(registry.is_cancelled());
        assert_eq!(engine.open_transports(), 0);

        // Actor loop has exited; requests fail instead of hanging.
        let late = registry.create_room(RoomId::from("R2")).await;
        assert!(late.is_err());
    }

    async fn join(room: &Room, id: &str) -> mpsc::Receiver<crate::room::PeerEvent> {
        let (tx, rx) = mpsc::channel(4);
        let peer_id = PeerId::from(id);
        room.add_peer(Peer::new(peer_id.clone(), id, EventSink::new(peer_id, tx)))
            .await
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_engine_call_does_not_stall_registry() {
        let engine = LoopbackEngine::new(LoopbackOptions {
            call_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let (registry, _engine) = registry_on(engine, 1).await;
        let room = registry.create_room(RoomId::from("R1")).await.unwrap();
        let _rx_a = join(&room, "a").await;
        let _rx_b = join(&room, "b").await;
        let a = PeerId::from("a");
        let transport = room.create_webrtc_transport(&a).await.unwrap();

        let connecting = {
            let room = Arc::clone(&room);
            tokio::spawn(async move {
                room.connect_peer_transport(&a, &transport.id, json!({"role": "client"}))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(room.remove_peer(&PeerId::from("b")).await);
        let kept = tokio::time::timeout(Duration::from_secs(2), registry.delete_room_if_empty(&room))
            .await
            .expect("emptiness check is not blocked by the engine call");
        assert!(!kept.unwrap());

        let other = tokio::time::timeout(Duration::from_secs(2), registry.create_room(RoomId::from("R2")))
            .await
            .expect("createRoom is not blocked by another room");
        assert!(other.is_ok());

        connecting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_room_id_is_reusable() {
        let (registry, _engine) = registry(1).await;
        let old = registry.create_room(RoomId::from("R1")).await.unwrap();

        // Last peer left and closed the room; the entry is not forgotten yet.
        assert!(old.close_if_empty().await);
        let lookup = registry.get_room(RoomId::from("R1")).await;
        assert!(matches!(lookup, Err(RcError::RoomNotFound(_))));

        let new = registry.create_room(RoomId::from("R1")).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));

        // A late removal of the old room leaves the new one in place.
        assert!(registry.delete_room_if_empty(&old).await.unwrap());
        let found = registry.get_room(RoomId::from("R1")).await.unwrap();
        assert!(Arc::ptr_eq(&found, &new));
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);
    }

    #[tokio::test]
    async fn test_requests_after_exit_are_counted_as_dropped() {
        let (registry, _engine) = registry(1).await;
        registry.get_status().await.unwrap();
        assert_eq!(registry.mailbox().messages_processed(), 1);

        registry.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.mailbox().messages_dropped() == 0 {
                let _ = registry.get_status().await;
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sends fail once the actor is gone");
        assert!(registry.get_status().await.is_err());
    }
}
