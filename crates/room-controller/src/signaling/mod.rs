//! WebSocket signaling.
//!
//! - [`protocol`] - frame envelope and request validation
//! - [`dispatcher`] - maps requests to registry and room operations
//! - [`server`] - axum `/ws` endpoint wiring sockets to connection actors

pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use dispatcher::{Session, SignalingDispatcher};
pub use protocol::{ClientRequest, ResponseFrame};
pub use server::{signaling_router, SignalingState};
