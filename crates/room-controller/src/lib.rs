//! Switchyard Room Controller
//!
//! Session orchestration for a multi-party WebRTC conferencing service:
//!
//! - Room lifecycle, one media router per room
//! - Per-participant transports, producers and consumers
//! - Close cascades keeping every peer's view of the room consistent
//! - WebSocket signaling with correlated request/response frames
//!
//! Media itself is handled by an external engine behind the [`media`]
//! traits; this crate only orchestrates it.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (round-robin media workers, death watchers)
//! RoomRegistryActor
//! └── Room (router + peers)
//!     └── Peer (transports, producers, consumers)
//! signaling server
//! └── ConnectionActor (one per socket) -> SignalingDispatcher
//! ```
//!
//! # Modules
//!
//! - [`actors`] - registry and connection actors
//! - [`config`] - service configuration from environment
//! - [`errors`] - error types with signaling error codes
//! - [`media`] - media engine facade and the loopback engine
//! - [`observability`] - metrics and health endpoints
//! - [`room`] - room and peer state
//! - [`signaling`] - wire protocol, dispatch and the `/ws` endpoint
//! - [`workers`] - media worker pool

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod room;
pub mod signaling;
pub mod workers;
