//! Message types for the room actor.
//!
//! Every request to a room goes through its mailbox as a [`RoomMessage`];
//! replies come back on a `tokio::sync::oneshot` channel.

use crate::errors::CoordinatorError;
use crate::producers::ProducerSnapshot;
use common::signaling::{ParticipantSummary, ServerMessage, WaitingEntrySummary};
use common::types::{
    Capability, ConnectionState, ConsumerDescriptor, ConsumerRef, ConsumerState, MediaKind,
    PermissionSet, ProducerRef, QualityTier, Role, ScalabilityPolicy, TransportDirection,
};
use tokio::sync::oneshot;

/// Reply channel carrying a coordinator result.
pub type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

/// A participant asking to enter a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
}

/// Everything a newly admitted participant needs.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSnapshot {
    pub room_id: String,
    pub participant_id: String,
    pub rtp_capabilities: serde_json::Value,
    /// Live producers owned by other participants.
    pub existing_producers: Vec<ProducerRef>,
    pub revision: u64,
    pub permissions: PermissionSet,
    pub participants: Vec<ParticipantSummary>,
    pub policy: ScalabilityPolicy,
}

impl JoinSnapshot {
    pub fn into_message(self) -> ServerMessage {
        ServerMessage::JoinResponse {
            room_id: self.room_id,
            participant_id: self.participant_id,
            rtp_capabilities: self.rtp_capabilities,
            existing_producers: self.existing_producers,
            revision: self.revision,
            permissions: self.permissions,
            participants: self.participants,
            policy: self.policy,
        }
    }
}

/// Result of a join request.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Joined(Box<JoinSnapshot>),
    /// Queued for approval at a 1-based position.
    Waiting { position: usize },
}

/// Why a participant is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Explicit,
    Disconnected,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Explicit => "left",
            LeaveReason::Disconnected => "disconnected",
        }
    }
}

/// Result of a leave. Engine objects listed here still need closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left {
        producers: Vec<ProducerRef>,
        transports: Vec<String>,
    },
    /// The participant was still in the waiting room.
    CancelledWaiting,
    NotPresent,
}

/// Result of a grant or revoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// The flag changed. A revoke lists the producers it force-closed.
    Applied { closed_producers: Vec<ProducerRef> },
    /// The flag already had the requested value.
    Unchanged,
}

/// Result of recording a new transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportReplacement {
    /// Previous transport of the same direction, now detached.
    pub replaced: Option<String>,
    /// Producers that rode on the replaced send transport.
    pub closed_producers: Vec<ProducerRef>,
}

/// Authorization to consume one producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeTicket {
    /// The caller's connected receive transport.
    pub transport_id: String,
    pub kind: MediaKind,
    pub owner_id: String,
}

/// One participant as seen in a roster snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
    pub connection_state: ConnectionState,
    pub permissions: PermissionSet,
    pub audio: bool,
    pub video: bool,
    pub producers: Vec<ProducerRef>,
    pub consumers: Vec<ConsumerRef>,
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterSnapshot {
    pub room_id: String,
    pub class_ref: String,
    pub participants: Vec<RosterEntry>,
    pub waiting: Vec<WaitingEntrySummary>,
    pub producers: ProducerSnapshot,
    pub policy: ScalabilityPolicy,
}

impl RosterSnapshot {
    pub fn participant(&self, participant_id: &str) -> Option<&RosterEntry> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }
}

/// Producers and consumers the quality adapter samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInventory {
    pub producers: Vec<ProducerRef>,
    pub consumers: Vec<ConsumerRef>,
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        request: JoinRequest,
        respond_to: Reply<JoinOutcome>,
    },

    Leave {
        participant_id: String,
        reason: LeaveReason,
        respond_to: Reply<LeaveOutcome>,
    },

    Approve {
        moderator_id: String,
        participant_id: String,
        respond_to: Reply<()>,
    },

    Deny {
        moderator_id: String,
        participant_id: String,
        respond_to: Reply<()>,
    },

    SetPermission {
        moderator_id: String,
        participant_id: String,
        capability: Capability,
        granted: bool,
        respond_to: Reply<PermissionOutcome>,
    },

    RequestPermission {
        participant_id: String,
        capability: Capability,
        respond_to: Reply<()>,
    },

    UpdateMediaState {
        participant_id: String,
        audio: bool,
        video: bool,
        respond_to: Reply<()>,
    },

    /// Verify the participant is joined.
    CheckMember {
        participant_id: String,
        respond_to: Reply<()>,
    },

    RecordTransport {
        participant_id: String,
        transport_id: String,
        direction: TransportDirection,
        respond_to: Reply<TransportReplacement>,
    },

    /// Direction of a transport the participant owns.
    TransportDirection {
        participant_id: String,
        transport_id: String,
        respond_to: Reply<TransportDirection>,
    },

    TransportConnected {
        participant_id: String,
        transport_id: String,
        respond_to: Reply<()>,
    },

    AuthorizeProduce {
        participant_id: String,
        transport_id: String,
        kind: MediaKind,
        respond_to: Reply<()>,
    },

    ProducerCreated {
        participant_id: String,
        transport_id: String,
        producer_id: String,
        kind: MediaKind,
        respond_to: Reply<ProducerRef>,
    },

    CloseProducer {
        participant_id: String,
        producer_id: String,
        respond_to: Reply<ProducerRef>,
    },

    AuthorizeConsume {
        participant_id: String,
        producer_id: String,
        respond_to: Reply<ConsumeTicket>,
    },

    ConsumerCreated {
        participant_id: String,
        transport_id: String,
        consumer: ConsumerDescriptor,
        respond_to: Reply<ConsumerRef>,
    },

    /// Owner-driven consumer state change. Replies with the previous state.
    UpdateConsumerState {
        participant_id: String,
        consumer_id: String,
        state: ConsumerState,
        respond_to: Reply<ConsumerState>,
    },

    /// Send the producer list to one participant, or everyone when `None`.
    PublishProducerList {
        recipient: Option<String>,
        respond_to: Reply<()>,
    },

    RosterSnapshot {
        respond_to: oneshot::Sender<RosterSnapshot>,
    },

    MediaInventory {
        respond_to: oneshot::Sender<MediaInventory>,
    },

    QualityTierChanged {
        producer_id: String,
        tier: QualityTier,
    },

    /// Mark a consumer degraded (pause) or recovered (resume). Replies
    /// whether the change applied.
    ConsumerDegraded {
        consumer_id: String,
        degraded: bool,
        respond_to: oneshot::Sender<bool>,
    },

    /// Close the room if nobody is joined or waiting. Replies whether it closed.
    CloseIfEmpty {
        respond_to: oneshot::Sender<bool>,
    },
}

impl RoomMessage {
    /// Bounded label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            RoomMessage::Join { .. } => "join",
            RoomMessage::Leave { .. } => "leave",
            RoomMessage::Approve { .. } => "approve",
            RoomMessage::Deny { .. } => "deny",
            RoomMessage::SetPermission { .. } => "set_permission",
            RoomMessage::RequestPermission { .. } => "request_permission",
            RoomMessage::UpdateMediaState { .. } => "update_media_state",
            RoomMessage::CheckMember { .. } => "check_member",
            RoomMessage::RecordTransport { .. } => "record_transport",
            RoomMessage::TransportDirection { .. } => "transport_direction",
            RoomMessage::TransportConnected { .. } => "transport_connected",
            RoomMessage::AuthorizeProduce { .. } => "authorize_produce",
            RoomMessage::ProducerCreated { .. } => "producer_created",
            RoomMessage::CloseProducer { .. } => "close_producer",
            RoomMessage::AuthorizeConsume { .. } => "authorize_consume",
            RoomMessage::ConsumerCreated { .. } => "consumer_created",
            RoomMessage::UpdateConsumerState { .. } => "update_consumer_state",
            RoomMessage::PublishProducerList { .. } => "publish_producer_list",
            RoomMessage::RosterSnapshot { .. } => "roster_snapshot",
            RoomMessage::MediaInventory { .. } => "media_inventory",
            RoomMessage::QualityTierChanged { .. } => "quality_tier_changed",
            RoomMessage::ConsumerDegraded { .. } => "consumer_degraded",
            RoomMessage::CloseIfEmpty { .. } => "close_if_empty",
        }
    }
}
