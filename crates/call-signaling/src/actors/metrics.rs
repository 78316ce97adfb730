//! Actor metrics and mailbox monitoring.
//!
//! Provides mailbox depth monitoring with per-actor thresholds:
//!
//! | Actor Type | Normal | Warning  | Critical |
//! |------------|--------|----------|----------|
//! | Registry   | < 200  | 200-1000 | > 1000   |
//! | Room       | < 100  | 100-500  | > 500    |
//! | Connection | < 50   | 50-200   | > 200    |
//!
//! Counts kept here are mirrored to the `cs_` Prometheus gauges in
//! [`crate::observability::metrics`].

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the registry actor.
pub const REGISTRY_MAILBOX_NORMAL: usize = 200;
pub const REGISTRY_MAILBOX_WARNING: usize = 1000;

/// Mailbox depth thresholds for room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Outbound queue thresholds for connection writers.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// Connection writer (one per client channel).
    Connection,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    /// Returns the warning threshold for this actor type.
    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_WARNING,
            ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    /// Returns the normal threshold for this actor type.
    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_NORMAL,
            ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Mailbox monitor for tracking queue depth and drops.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id or connection id.
    actor_id: String,
    depth: AtomicUsize,
    /// Peak depth since last reset.
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    /// Messages dropped due to a full queue.
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    /// Create a new mailbox monitor for the given actor.
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

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;

        let mut current_peak = self.peak_depth.load(Ordering::Relaxed);
        while new_depth > current_peak {
            match self.peak_depth.compare_exchange_weak(
                current_peak,
                new_depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_peak = actual,
            }
        }

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "cs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            // Once per crossing
            debug!(
                target: "cs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
        }
    }

    /// Record a message being removed from the mailbox.
    pub fn record_dequeue(&self) {
        // Saturate so an unmatched dequeue cannot wrap
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message being dropped because the queue was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_event_dropped(self.actor_type.as_str());
        warn!(
            target: "cs.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped = dropped,
            "Message dropped due to backpressure"
        );
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

    /// Get the current mailbox level.
    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    /// Reset peak depth counter to the current depth.
    pub fn reset_peak(&self) {
        self.peak_depth
            .store(self.current_depth(), Ordering::Relaxed);
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

/// Aggregated metrics for the actor system.
///
/// Shared by the registry, every room and the gateway. Each change is also
/// published to the matching Prometheus gauge.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    /// Rooms currently alive.
    pub active_rooms: AtomicUsize,
    /// Client channels currently open.
    pub active_connections: AtomicUsize,
    /// Participants (active or in grace) across all rooms.
    pub active_participants: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    /// Total messages processed across all actors.
    pub total_messages_processed: AtomicU64,
}

fn decrement(counter: &AtomicUsize) -> usize {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            Some(c.saturating_sub(1))
        })
        .unwrap_or(0);
    previous.saturating_sub(1)
}

impl ActorMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let count = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(count as u64);
    }

    pub fn room_removed(&self) {
        let count = decrement(&self.active_rooms);
        prom::set_rooms_active(count as u64);
    }

    pub fn connection_opened(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(count as u64);
    }

    pub fn connection_closed(&self) {
        let count = decrement(&self.active_connections);
        prom::set_connections_active(count as u64);
    }

    pub fn participant_added(&self) {
        let count = self.active_participants.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_participants_active(count as u64);
    }

    pub fn participant_removed(&self) {
        let count = decrement(&self.active_participants);
        prom::set_participants_active(count as u64);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "cs.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    /// Record a message being processed.
    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
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
    pub fn participant_count(&self) -> usize {
        self.active_participants.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_as_str() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Connection.as_str(), "connection");
    }

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Registry.normal_threshold(), 200);
        assert_eq!(ActorType::Registry.warning_threshold(), 1000);
        assert_eq!(ActorType::Room.normal_threshold(), 100);
        assert_eq!(ActorType::Room.warning_threshold(), 500);
        assert_eq!(ActorType::Connection.normal_threshold(), 50);
        assert_eq!(ActorType::Connection.warning_threshold(), 200);
    }

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-123");

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
    fn test_mailbox_monitor_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-123");

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new(ActorType::Room, "room-123");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..150 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..400 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_monitor_connection_thresholds() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-456");

        for _ in 0..75 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..150 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_monitor_drop_and_reset_peak() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1");

        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);

        for _ in 0..10 {
            monitor.record_enqueue();
        }
        for _ in 0..5 {
            monitor.record_dequeue();
        }
        assert_eq!(monitor.peak_depth(), 10);

        monitor.reset_peak();
        assert_eq!(monitor.peak_depth(), 5);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.room_created();
        metrics.room_removed();
        assert_eq!(metrics.room_count(), 1);

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.connection_count(), 1);

        metrics.participant_added();
        metrics.participant_removed();
        metrics.participant_removed();
        assert_eq!(metrics.participant_count(), 0);
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();

        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Registry);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 2);
    }
}
