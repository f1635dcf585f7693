//! Versioned signaling protocol.
//!
//! Every frame on the signaling channel is a JSON object carrying the
//! protocol version `v`, an optional `requestId` used to correlate replies,
//! and a `type` tag selecting one [`ClientMessage`] or [`ServerMessage`]
//! variant:
//!
//! ```json
//! {"v":1,"requestId":7,"type":"createTransport","direction":"send"}
//! ```
//!
//! Inbound frames go through [`decode_client_frame`], which checks the
//! version, deserializes the tagged union and validates field contents
//! before anything reaches the coordinator.

use crate::error::ErrorCategory;
use crate::types::{
    Capability, ConsumerDescriptor, MediaKind, PermissionSet, ProducerRef, QualityTier, Role,
    ScalabilityPolicy, TransportDescriptor, TransportDirection,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum length of any identifier carried in a frame.
pub const MAX_ID_LEN: usize = 128;

/// Maximum length of a display name.
pub const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Frame wrapper carrying version and request correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub v: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    /// Wrap a message at the current protocol version.
    pub fn new(body: T) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            request_id: None,
            body,
        }
    }

    /// Attach the request id of the frame being answered.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<u64>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Messages sent by participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join (or request admission to) a class room. Identity and role are
    /// asserted by the authenticating proxy in front of the coordinator.
    JoinRoom {
        room_id: String,
        #[serde(default)]
        class_ref: Option<String>,
        participant_id: String,
        display_name: String,
        role: Role,
    },
    LeaveRoom,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: serde_json::Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    },
    CloseProducer {
        producer_id: String,
    },
    Consume {
        producer_id: String,
        rtp_capabilities: serde_json::Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    PauseConsumer {
        consumer_id: String,
    },
    RequestProducerList,
    ApproveParticipant {
        participant_id: String,
    },
    DenyParticipant {
        participant_id: String,
    },
    GrantPermission {
        participant_id: String,
        capability: Capability,
    },
    RevokePermission {
        participant_id: String,
        capability: Capability,
    },
    RequestPermission {
        capability: Capability,
    },
    UpdateMediaState {
        audio: bool,
        video: bool,
    },
}

impl ClientMessage {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::CreateTransport { .. } => "create_transport",
            ClientMessage::ConnectTransport { .. } => "connect_transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::CloseProducer { .. } => "close_producer",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume_consumer",
            ClientMessage::PauseConsumer { .. } => "pause_consumer",
            ClientMessage::RequestProducerList => "request_producer_list",
            ClientMessage::ApproveParticipant { .. } => "approve_participant",
            ClientMessage::DenyParticipant { .. } => "deny_participant",
            ClientMessage::GrantPermission { .. } => "grant_permission",
            ClientMessage::RevokePermission { .. } => "revoke_permission",
            ClientMessage::RequestPermission { .. } => "request_permission",
            ClientMessage::UpdateMediaState { .. } => "update_media_state",
        }
    }

    /// Check field contents that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] for empty or oversized
    /// identifiers and display names, and for opaque parameters that are
    /// not JSON objects.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::JoinRoom {
                room_id,
                class_ref,
                participant_id,
                display_name,
                ..
            } => {
                check_id("roomId", room_id)?;
                check_id("participantId", participant_id)?;
                if let Some(class_ref) = class_ref {
                    check_id("classRef", class_ref)?;
                }
                let trimmed = display_name.trim();
                if trimmed.is_empty() || trimmed.chars().count() > MAX_DISPLAY_NAME_LEN {
                    return Err(ProtocolError::InvalidField {
                        field: "displayName",
                        reason: format!("must be 1-{MAX_DISPLAY_NAME_LEN} characters"),
                    });
                }
                Ok(())
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                check_id("transportId", transport_id)?;
                check_object("dtlsParameters", dtls_parameters)
            }
            ClientMessage::Produce {
                transport_id,
                rtp_parameters,
                ..
            } => {
                check_id("transportId", transport_id)?;
                check_object("rtpParameters", rtp_parameters)
            }
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                check_id("producerId", producer_id)?;
                check_object("rtpCapabilities", rtp_capabilities)
            }
            ClientMessage::CloseProducer { producer_id } => check_id("producerId", producer_id),
            ClientMessage::ResumeConsumer { consumer_id }
            | ClientMessage::PauseConsumer { consumer_id } => check_id("consumerId", consumer_id),
            ClientMessage::ApproveParticipant { participant_id }
            | ClientMessage::DenyParticipant { participant_id }
            | ClientMessage::GrantPermission { participant_id, .. }
            | ClientMessage::RevokePermission { participant_id, .. } => {
                check_id("participantId", participant_id)
            }
            ClientMessage::LeaveRoom
            | ClientMessage::CreateTransport { .. }
            | ClientMessage::RequestProducerList
            | ClientMessage::RequestPermission { .. }
            | ClientMessage::UpdateMediaState { .. } => Ok(()),
        }
    }
}

fn check_id(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(ProtocolError::InvalidField {
            field,
            reason: format!("must be 1-{MAX_ID_LEN} bytes"),
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidField {
            field,
            reason: "must not contain control characters".to_string(),
        });
    }
    Ok(())
}

fn check_object(field: &'static str, value: &serde_json::Value) -> Result<(), ProtocolError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidField {
            field,
            reason: "must be a JSON object".to_string(),
        })
    }
}

/// Participant summary shown in rosters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
    pub permissions: PermissionSet,
    pub audio: bool,
    pub video: bool,
}

/// One row of a full-grant resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPermissions {
    pub participant_id: String,
    pub permissions: PermissionSet,
}

/// Waiting-room entry as shown to moderators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingEntrySummary {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
    pub requested_at: DateTime<Utc>,
}

/// Messages sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    JoinResponse {
        room_id: String,
        participant_id: String,
        rtp_capabilities: serde_json::Value,
        existing_producers: Vec<ProducerRef>,
        revision: u64,
        permissions: PermissionSet,
        participants: Vec<ParticipantSummary>,
        policy: ScalabilityPolicy,
    },
    WaitingForApproval {
        room_id: String,
        position: usize,
    },
    WaitingRoomApproved {
        room_id: String,
    },
    WaitingRoomDenied {
        room_id: String,
    },
    WaitingRoomUpdate {
        entries: Vec<WaitingEntrySummary>,
    },
    TransportCreated {
        transport: TransportDescriptor,
    },
    TransportConnected {
        transport_id: String,
    },
    ProducerCreated {
        producer_id: String,
        kind: MediaKind,
    },
    ConsumerCreated {
        consumer: ConsumerDescriptor,
    },
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },
    ProducerListUpdate {
        revision: u64,
        producers: Vec<ProducerRef>,
    },
    PermissionGranted {
        participant_id: String,
        capability: Capability,
    },
    PermissionRevoked {
        participant_id: String,
        capability: Capability,
    },
    PermissionsSync {
        participants: Vec<ParticipantPermissions>,
    },
    PermissionRequested {
        participant_id: String,
        capability: Capability,
    },
    PermissionRequestCancelled {
        participant_id: String,
        capability: Capability,
    },
    MediaStateChanged {
        participant_id: String,
        audio: bool,
        video: bool,
    },
    ParticipantJoined {
        participant: ParticipantSummary,
    },
    ParticipantLeft {
        participant_id: String,
    },
    #[serde(rename = "scalabilityPolicy")]
    ScalabilityPolicyChanged {
        policy: ScalabilityPolicy,
    },
    QualityTierChanged {
        producer_id: String,
        tier: QualityTier,
    },
    ConsumerPaused {
        consumer_id: String,
        reason: String,
    },
    ConsumerResumed {
        consumer_id: String,
    },
    Ack,
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl ServerMessage {
    /// Whether this message carries media-plane information (producer
    /// announcements, tiers, consumer state). Waiting participants never
    /// receive these.
    #[must_use]
    pub const fn is_media_event(&self) -> bool {
        matches!(
            self,
            ServerMessage::NewProducer { .. }
                | ServerMessage::ProducerClosed { .. }
                | ServerMessage::ProducerListUpdate { .. }
                | ServerMessage::QualityTierChanged { .. }
                | ServerMessage::ConsumerPaused { .. }
                | ServerMessage::ConsumerResumed { .. }
                | ServerMessage::MediaStateChanged { .. }
        )
    }
}

/// Boundary validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolError {
    /// All boundary failures are validation errors for the sender.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

/// A frame rejected at the boundary, with the request id if one could be read.
#[derive(Debug, PartialEq, Eq)]
pub struct RejectedFrame {
    pub request_id: Option<u64>,
    pub error: ProtocolError,
}

/// Decode and validate one inbound text frame.
///
/// # Errors
///
/// Returns [`RejectedFrame`] when the frame is not JSON, carries an
/// unsupported version, names an unknown message type, or fails
/// [`ClientMessage::validate`].
pub fn decode_client_frame(text: &str) -> Result<Envelope<ClientMessage>, RejectedFrame> {
    let raw: serde_json::Value = serde_json::from_str(text).map_err(|e| RejectedFrame {
        request_id: None,
        error: ProtocolError::Malformed(e.to_string()),
    })?;

    let request_id = raw.get("requestId").and_then(serde_json::Value::as_u64);
    let reject = |error| RejectedFrame { request_id, error };

    match raw.get("v").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(PROTOCOL_VERSION) => {}
        Some(v) => return Err(reject(ProtocolError::UnsupportedVersion(v))),
        None => {
            return Err(reject(ProtocolError::Malformed(
                "missing protocol version".to_string(),
            )))
        }
    }

    let envelope: Envelope<ClientMessage> = serde_json::from_value(raw)
        .map_err(|e| reject(ProtocolError::Malformed(e.to_string())))?;

    envelope.body.validate().map_err(reject)?;

    Ok(envelope)
}

/// Encode one outbound frame.
///
/// # Errors
///
/// Returns the serializer error; only possible for non-string map keys,
/// which these types never contain.
pub fn encode_server_frame(
    request_id: Option<u64>,
    message: ServerMessage,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope::new(message).with_request_id(request_id))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_join_room() {
        let frame = json!({
            "v": 1,
            "requestId": 3,
            "type": "joinRoom",
            "roomId": "class-42",
            "participantId": "t1",
            "displayName": "Ms. Frizzle",
            "role": "Teacher"
        })
        .to_string();

        let envelope = decode_client_frame(&frame).unwrap();
        assert_eq!(envelope.request_id, Some(3));
        assert!(matches!(
            envelope.body,
            ClientMessage::JoinRoom {
                ref room_id,
                class_ref: None,
                role: Role::Teacher,
                ..
            } if room_id == "class-42"
        ));
    }

    #[test]
    fn test_unit_variant_decodes() {
        let envelope = decode_client_frame(r#"{"v":1,"type":"requestProducerList"}"#).unwrap();
        assert_eq!(envelope.body, ClientMessage::RequestProducerList);
        assert_eq!(envelope.request_id, None);
    }

    #[test]
    fn test_rejects_unsupported_version_with_request_id() {
        let rejected =
            decode_client_frame(r#"{"v":2,"requestId":9,"type":"leaveRoom"}"#).unwrap_err();
        assert_eq!(rejected.request_id, Some(9));
        assert_eq!(rejected.error, ProtocolError::UnsupportedVersion(2));
    }

    #[test]
    fn test_rejects_missing_version() {
        let rejected = decode_client_frame(r#"{"type":"leaveRoom"}"#).unwrap_err();
        assert!(matches!(rejected.error, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let rejected =
            decode_client_frame(r#"{"v":1,"requestId":1,"type":"launchRocket"}"#).unwrap_err();
        assert_eq!(rejected.request_id, Some(1));
        assert!(matches!(rejected.error, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_rejects_non_json() {
        let rejected = decode_client_frame("not json").unwrap_err();
        assert_eq!(rejected.request_id, None);
        assert_eq!(rejected.error.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_validation_rejects_empty_ids_and_non_object_params() {
        let empty_producer = json!({
            "v": 1, "type": "consume", "producerId": "", "rtpCapabilities": {}
        })
        .to_string();
        let rejected = decode_client_frame(&empty_producer).unwrap_err();
        assert!(matches!(
            rejected.error,
            ProtocolError::InvalidField {
                field: "producerId",
                ..
            }
        ));

        let bad_caps = json!({
            "v": 1, "type": "consume", "producerId": "p1", "rtpCapabilities": "opus"
        })
        .to_string();
        let rejected = decode_client_frame(&bad_caps).unwrap_err();
        assert!(matches!(
            rejected.error,
            ProtocolError::InvalidField {
                field: "rtpCapabilities",
                ..
            }
        ));

        let blank_name = json!({
            "v": 1, "type": "joinRoom", "roomId": "r", "participantId": "s1",
            "displayName": "   ", "role": "student"
        })
        .to_string();
        assert!(decode_client_frame(&blank_name).is_err());
    }

    #[test]
    fn test_encode_server_frame_shape() {
        let text = encode_server_frame(
            Some(5),
            ServerMessage::NewProducer {
                producer_id: "p1".to_string(),
                peer_id: "alice".to_string(),
                kind: MediaKind::Video,
            },
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["requestId"], 5);
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["producerId"], "p1");
        assert_eq!(value["peerId"], "alice");
    }

    #[test]
    fn test_server_frames_decode_back() {
        let text = encode_server_frame(None, ServerMessage::Ack).unwrap();
        let envelope: Envelope<ServerMessage> = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.body, ServerMessage::Ack);

        let text = encode_server_frame(
            None,
            ServerMessage::ScalabilityPolicyChanged {
                policy: ScalabilityPolicy {
                    max_video_streams: 9,
                    audio_only_recommended: true,
                    bandwidth_limit_kbps: 800,
                },
            },
        )
        .unwrap();
        assert!(text.contains("\"type\":\"scalabilityPolicy\""));
        assert!(text.contains("\"audioOnlyRecommended\":true"));
    }

    #[test]
    fn test_media_event_classification() {
        assert!(ServerMessage::ProducerListUpdate {
            revision: 1,
            producers: vec![]
        }
        .is_media_event());
        assert!(!ServerMessage::WaitingRoomApproved {
            room_id: "r".to_string()
        }
        .is_media_event());
    }
}
