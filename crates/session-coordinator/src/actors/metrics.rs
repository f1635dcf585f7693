//! Actor metrics and mailbox monitoring.
//!
//! Room mailbox depth thresholds:
//!
//! | Normal | Warning | Critical |
//! |--------|---------|----------|
//! | < 100  | 100-500 | > 500    |

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// RoomActor (one per room).
    Room,
    /// QualityAdapter (one per room).
    Quality,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Room => "room",
            ActorType::Quality => "quality",
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

/// Tracks one room actor's queue depth.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Room,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message arriving, given the number still queued behind it.
    pub fn record_enqueue(&self, backlog: usize) {
        let new_depth = backlog + 1;
        self.depth.store(new_depth, Ordering::Relaxed);
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => warn!(
                target: "sc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = ROOM_MAILBOX_WARNING,
                "Mailbox depth critical"
            ),
            MailboxLevel::Warning => debug!(
                target: "sc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            ),
            MailboxLevel::Normal => {}
        }
    }

    /// Record the current message as processed.
    pub fn record_dequeue(&self) {
        let remaining = self.depth.load(Ordering::Relaxed).saturating_sub(1);
        self.depth.store(remaining, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
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
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > ROOM_MAILBOX_WARNING {
            MailboxLevel::Critical
        } else if depth > ROOM_MAILBOX_NORMAL {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Process-wide actor counters, shared by the registry and every room.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_participants: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
    pub total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        let rooms = self
            .active_rooms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .map_or(0, |previous| previous.saturating_sub(1));
        metrics::set_rooms_active(rooms);
    }

    pub fn participant_joined(&self) {
        let participants = self.active_participants.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_participants_active(participants);
    }

    pub fn participant_left(&self) {
        let participants = self
            .active_participants
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .map_or(0, |previous| previous.saturating_sub(1));
        metrics::set_participants_active(participants);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.active_participants.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_labels() {
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Quality.as_str(), "quality");
    }

    #[test]
    fn test_mailbox_monitor_tracks_backlog() {
        let monitor = MailboxMonitor::new("room-1");
        assert_eq!(monitor.current_depth(), 0);

        monitor.record_enqueue(2);
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);

        monitor.record_enqueue(0);
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.peak_depth(), 3);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new("room-1");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        monitor.record_enqueue(150);
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        monitor.record_enqueue(600);
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_actor_metrics_counts_never_underflow() {
        let metrics = ActorMetrics::new();
        metrics.room_created();
        metrics.room_created();
        metrics.participant_joined();
        assert_eq!(metrics.room_count(), 2);
        assert_eq!(metrics.participant_count(), 1);

        metrics.room_removed();
        metrics.participant_left();
        metrics.participant_left();
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.participant_count(), 0);
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Quality);
        assert_eq!(metrics.panic_count(), 2);
    }
}
