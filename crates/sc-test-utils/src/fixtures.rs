//! Participant and policy fixtures.

use common::signaling::ClientMessage;
use common::types::{Capability, MediaKind, Role, TransportDirection};
use serde_json::json;
use session_coordinator::admission::ClassPolicy;

/// A participant identity used to build requests.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
}

impl TestParticipant {
    pub fn new(participant_id: &str, role: Role) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            display_name: format!("Test {participant_id}"),
            role,
        }
    }

    pub fn teacher(participant_id: &str) -> Self {
        Self::new(participant_id, Role::Teacher)
    }

    pub fn student(participant_id: &str) -> Self {
        Self::new(participant_id, Role::Student)
    }

    pub fn assistant(participant_id: &str) -> Self {
        Self::new(participant_id, Role::Assistant)
    }

    /// `joinRoom` for `room_id` (class ref defaults to the room id).
    pub fn join_message(&self, room_id: &str) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            class_ref: None,
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
        }
    }
}

/// Policy for a class that admits students without approval.
pub fn open_class() -> ClassPolicy {
    ClassPolicy::with_defaults(false)
}

/// Policy for a class where students wait for a moderator.
pub fn moderated_class() -> ClassPolicy {
    ClassPolicy::with_defaults(true)
}

pub fn create_transport(direction: TransportDirection) -> ClientMessage {
    ClientMessage::CreateTransport { direction }
}

pub fn connect_transport(transport_id: &str) -> ClientMessage {
    ClientMessage::ConnectTransport {
        transport_id: transport_id.to_string(),
        dtls_parameters: json!({ "role": "client", "fingerprints": [] }),
    }
}

pub fn produce(transport_id: &str, kind: MediaKind) -> ClientMessage {
    ClientMessage::Produce {
        transport_id: transport_id.to_string(),
        kind,
        rtp_parameters: json!({ "codecs": [], "encodings": [] }),
    }
}

pub fn consume(producer_id: &str) -> ClientMessage {
    ClientMessage::Consume {
        producer_id: producer_id.to_string(),
        rtp_capabilities: json!({ "codecs": [] }),
    }
}

pub fn grant(participant_id: &str, capability: Capability) -> ClientMessage {
    ClientMessage::GrantPermission {
        participant_id: participant_id.to_string(),
        capability,
    }
}

pub fn revoke(participant_id: &str, capability: Capability) -> ClientMessage {
    ClientMessage::RevokePermission {
        participant_id: participant_id.to_string(),
        capability,
    }
}
