//! Participant-to-connection routing.
//!
//! The [`PresenceGateway`] maps participant ids to the outbound queue of
//! their live signaling connection. Room actors push notifications through
//! it without knowing anything about sockets.
//!
//! Delivery is best effort: each connection has a bounded queue and a full
//! queue drops the message (counted in `sc_messages_dropped_total`). The
//! periodic producer list repairs any media events lost this way.

use crate::observability::metrics;
use common::signaling::ServerMessage;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Outbound queue depth per connection.
pub const OUTBOUND_BUFFER: usize = 256;

/// Sender half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<ServerMessage>;

struct ConnectionEntry {
    connection_id: String,
    sender: OutboundSender,
}

/// Registry of live signaling connections keyed by participant id.
///
/// Lookups take a shared lock so concurrent room actors do not serialize;
/// register/unregister take the exclusive lock. The lock is never held
/// across an await.
#[derive(Default)]
pub struct PresenceGateway {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl PresenceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `participant_id` to a connection.
    ///
    /// Returns the id of a previous connection that was displaced, if any.
    pub fn register(
        &self,
        participant_id: &str,
        connection_id: &str,
        sender: OutboundSender,
    ) -> Option<String> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = connections.insert(
            participant_id.to_string(),
            ConnectionEntry {
                connection_id: connection_id.to_string(),
                sender,
            },
        );
        metrics::set_connections_active(connections.len());
        previous.map(|entry| entry.connection_id)
    }

    /// Remove the binding, but only if it still belongs to `connection_id`.
    ///
    /// A stale connection tearing down after a newer one registered must
    /// not remove the newer binding.
    pub fn unregister(&self, participant_id: &str, connection_id: &str) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let owned = connections
            .get(participant_id)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if owned {
            connections.remove(participant_id);
            metrics::set_connections_active(connections.len());
        }
        owned
    }

    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(participant_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue `message` for one participant. Returns whether it was queued.
    pub fn send(&self, participant_id: &str, message: ServerMessage) -> bool {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = connections.get(participant_id) else {
            debug!(
                target: "sc.presence",
                participant_id = %participant_id,
                "No connection for participant, message not delivered"
            );
            return false;
        };

        match entry.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::record_message_dropped("presence");
                warn!(
                    target: "sc.presence",
                    participant_id = %participant_id,
                    connection_id = %entry.connection_id,
                    "Outbound queue full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "sc.presence",
                    participant_id = %participant_id,
                    "Connection closed, message not delivered"
                );
                false
            }
        }
    }

    /// Queue `message` for every participant in `recipients`.
    pub fn send_to_all<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a str>,
        message: &ServerMessage,
    ) {
        for participant_id in recipients {
            self.send(participant_id, message.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_routes_to_registered_connection() {
        let presence = PresenceGateway::new();
        let (tx, mut rx) = mpsc::channel(4);
        assert!(presence.register("alice", "conn-1", tx).is_none());

        assert!(presence.send("alice", ServerMessage::Ack));
        assert_eq!(rx.recv().await, Some(ServerMessage::Ack));
        assert!(!presence.send("bob", ServerMessage::Ack));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let presence = PresenceGateway::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);

        presence.register("alice", "conn-1", old_tx);
        let displaced = presence.register("alice", "conn-2", new_tx);
        assert_eq!(displaced.as_deref(), Some("conn-1"));

        assert!(!presence.unregister("alice", "conn-1"));
        assert!(presence.is_connected("alice"));
        assert!(presence.send("alice", ServerMessage::Ack));
        assert_eq!(new_rx.recv().await, Some(ServerMessage::Ack));

        assert!(presence.unregister("alice", "conn-2"));
        assert!(!presence.is_connected("alice"));
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let presence = PresenceGateway::new();
        let (tx, _rx) = mpsc::channel(1);
        presence.register("alice", "conn-1", tx);

        assert!(presence.send("alice", ServerMessage::Ack));
        assert!(!presence.send("alice", ServerMessage::Ack));
    }

    #[test]
    fn test_closed_receiver_is_not_delivered() {
        let presence = PresenceGateway::new();
        let (tx, rx) = mpsc::channel(1);
        presence.register("alice", "conn-1", tx);
        drop(rx);

        assert!(!presence.send("alice", ServerMessage::Ack));
        assert_eq!(presence.connection_count(), 1);
    }
}
