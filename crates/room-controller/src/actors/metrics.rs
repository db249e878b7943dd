//! Actor metrics and mailbox monitoring.
//!
//! Provides mailbox depth monitoring with per-actor thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Connection | < 16   | 16-64   | > 64     |
//!
//! Senders count a message in before handing it to the channel and the
//! actor counts it out as soon as it is received, so the depth is the
//! backlog waiting in the mailbox. Depth changes are mirrored to
//! `rc_actor_mailbox_depth`.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the room registry.
pub const REGISTRY_MAILBOX_NORMAL: usize = 100;
pub const REGISTRY_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 16;
pub const CONNECTION_MAILBOX_WARNING: usize = 64;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// RoomRegistryActor (singleton).
    Registry,
    /// ConnectionActor (one per signaling connection).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Mailbox monitor for tracking queue depth and emitting metrics.
///
/// Shared (`Arc`) between an actor and every clone of its handle.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Actor identifier (connection id for connection actors).
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message about to be sent to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            // Once, on crossing into warning
            debug!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
        }
    }

    /// Record the actor taking a message out of the mailbox.
    pub fn record_dequeue(&self) {
        self.decrement();
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a counted message that never reached the mailbox because the
    /// actor is gone.
    pub fn record_drop(&self) {
        self.decrement();
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "rc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = self.messages_dropped.load(Ordering::Relaxed),
            "Message dropped, actor mailbox closed"
        );
    }

    fn decrement(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), previous.saturating_sub(1));
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters for the actor system.
///
/// Shared between the registry, the signaling server and the connection
/// actors. The `rc_rooms_active` and `rc_connections_active` gauges follow
/// these values.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_rooms: AtomicUsize,
    active_connections: AtomicUsize,
    total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rooms(&self, count: usize) {
        self.active_rooms.store(count, Ordering::Relaxed);
        metrics::set_rooms_active(count);
    }

    pub fn connection_opened(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connections_active(count);
    }

    pub fn connection_closed(&self) {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        metrics::set_connections_active(previous.saturating_sub(1));
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.total_messages_processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Connection.as_str(), "connection");
        assert_eq!(ActorType::Registry.normal_threshold(), 100);
        assert_eq!(ActorType::Connection.warning_threshold(), 64);
    }

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new(ActorType::Registry, "registry");

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_connection_levels() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..20 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..50 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_record_drop_releases_depth() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1");
        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_processed(), 0);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.connection_count(), 1);

        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.connection_count(), 0);

        metrics.set_rooms(4);
        assert_eq!(metrics.room_count(), 4);

        metrics.record_message_processed();
        assert_eq!(metrics.messages_processed(), 1);
    }
}
