//! Message types for actor communication.
//!
//! Each request carries a `respond_to` oneshot sender for the reply.

use crate::errors::RcError;
use crate::room::Room;
use common::types::RoomId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Create a room and start acquiring its router.
    CreateRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<Arc<Room>, RcError>>,
    },

    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<Arc<Room>, RcError>>,
    },

    /// Close and remove a room. No-op for unknown ids.
    DeleteRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<()>,
    },

    /// Drop the entry for a room its last peer already closed, if that room
    /// is still the one registered under its id.
    ///
    /// Replies `true` if the entry was removed.
    ForgetClosedRoom {
        room: Arc<Room>,
        respond_to: oneshot::Sender<bool>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every existing one.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub accepting_new: bool,
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Text frame received from the client.
    Frame { text: String },

    /// Liveness check.
    Ping { respond_to: oneshot::Sender<()> },

    /// The socket is closing; clean up and stop.
    Close { reason: String },
}
