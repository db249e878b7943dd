//! Actor model for the Room Controller.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── owns Rooms (shared state, one async mutex each)
//!
//! ConnectionActor (one per signaling connection)
//! └── dispatches its client's requests against the registry and its room
//! ```
//!
//! Actors communicate through `mpsc` mailboxes with `oneshot` replies.
//! Rooms are not actors: requests from many connections mutate them
//! concurrently under the room lock, while each connection's own requests
//! are processed in order.

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::{ConnectionMessage, RegistryMessage, RegistryStatus};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::RoomRegistryHandle;
