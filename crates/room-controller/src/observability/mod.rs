//! Observability module for the Room Controller.
//!
//! Metric labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 2 values (registry, connection)
//! - `method`: bounded by the signaling method table
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rc_rooms_active` | Gauge | none | Rooms currently in the registry |
//! | `rc_peers_active` | Gauge | none | Peers joined across all rooms |
//! | `rc_connections_active` | Gauge | none | Open signaling connections |
//! | `rc_producers_total` | Counter | `kind` | Producers created |
//! | `rc_consumers_total` | Counter | `kind` | Consumers created |
//! | `rc_broadcast_dropped_total` | Counter | none | Event deliveries dropped on full or closed queues |
//! | `rc_router_wait_seconds` | Histogram | `outcome` | Time callers waited for a room's router |
//! | `rc_message_latency_seconds` | Histogram | `method` | Signaling message processing latency |
//! | `rc_worker_deaths_total` | Counter | none | Media worker deaths |
//! | `rc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator per actor type |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Lifecycle};
pub use metrics::init_metrics_recorder;
