//! Metrics definitions for the Room Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rc_` prefix for Room Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips, p99 target well under 100ms
        .set_buckets_for_metric(
            Matcher::Prefix("rc_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Router waits are bounded by RC_ROUTER_READY_TIMEOUT_MS (10s default)
        .set_buckets_for_metric(
            Matcher::Prefix("rc_router_wait".to_string()),
            &[
                0.001, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set router wait buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `rc_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_rooms_active").set(count as f64);
}

/// Metric: `rc_peers_active`
///
/// Adjusted by rooms as peers join and leave.
pub fn peer_joined() {
    gauge!("rc_peers_active").increment(1.0);
}

pub fn peer_left() {
    gauge!("rc_peers_active").decrement(1.0);
}

/// Metric: `rc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `rc_actor_mailbox_depth`
/// Labels: `actor_type` (registry, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `rc_producers_total`
/// Labels: `kind` (audio, video)
pub fn record_producer_created(kind: &'static str) {
    counter!("rc_producers_total", "kind" => kind).increment(1);
}

/// Metric: `rc_consumers_total`
/// Labels: `kind` (audio, video)
pub fn record_consumer_created(kind: &'static str) {
    counter!("rc_consumers_total", "kind" => kind).increment(1);
}

/// Record an event delivery dropped because the peer's queue was full or closed.
///
/// Metric: `rc_broadcast_dropped_total`
///
/// Non-zero values indicate slow or vanished clients.
pub fn record_broadcast_dropped() {
    counter!("rc_broadcast_dropped_total").increment(1);
}

/// Metric: `rc_worker_deaths_total`
///
/// ALERT: Any non-zero value means the process is about to exit.
pub fn record_worker_death() {
    counter!("rc_worker_deaths_total").increment(1);
}

/// Record messages dropped due to backpressure.
///
/// Metric: `rc_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("rc_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record how long a caller waited for a room's router.
///
/// Metric: `rc_router_wait_seconds`
/// Labels: `outcome` (ready, failed, timeout)
pub fn record_router_wait(outcome: &'static str, duration: Duration) {
    histogram!("rc_router_wait_seconds", "outcome" => outcome).record(duration.as_secs_f64());
}

/// Record signaling message processing latency.
///
/// Metric: `rc_message_latency_seconds`
/// Labels: `method`
///
/// Cardinality: bounded by the signaling method table (~15 values)
pub fn record_message_latency(method: &'static str, duration: Duration) {
    histogram!("rc_message_latency_seconds", "method" => method).record(duration.as_secs_f64());
}
