//! # RC Test Utilities
//!
//! Shared test utilities for the Room Controller.
//!
//! Everything runs in-process on the loopback media engine; no sockets and
//! no real media workers are involved.
//!
//! ## Modules
//!
//! - `fixtures` - [`TestServer`] wiring a worker pool, registry and dispatcher
//! - `client` - [`TestClient`] speaking the signaling protocol to a
//!   connection actor
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rc_test_utils::*;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestServer::start().await;
//!     let mut alice = server.connect("alice");
//!
//!     alice.request_ok("createRoom", json!({"room_id": "R1"})).await;
//!     alice.join("R1", "Alice").await;
//!
//!     let transport_id = alice.open_transport().await;
//!     let producer_id = alice.produce(&transport_id, "audio").await;
//! }
//! ```

pub mod client;
pub mod fixtures;

pub use client::*;
pub use fixtures::*;
