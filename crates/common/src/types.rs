//! Roles, capabilities and media references shared by coordinator and client.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Participant role within a class.
///
/// Parsed case-insensitively, serialized lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Role {
    Teacher,
    Admin,
    Hod,
    Dean,
    Assistant,
    Student,
    Guest,
}

impl Role {
    /// Roles allowed to admit participants and change capabilities.
    pub const MODERATORS: [Role; 4] = [Role::Teacher, Role::Admin, Role::Hod, Role::Dean];

    /// Whether this role belongs to the moderator set.
    #[must_use]
    pub fn is_moderator(self) -> bool {
        Self::MODERATORS.contains(&self)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Admin => "admin",
            Role::Hod => "hod",
            Role::Dean => "dean",
            Role::Assistant => "assistant",
            Role::Student => "student",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            "hod" => Ok(Role::Hod),
            "dean" => Ok(Role::Dean),
            "assistant" => Ok(Role::Assistant),
            "student" => Ok(Role::Student),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Kind of media carried by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grantable media capability. `mic` gates audio, `camera` gates video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Mic,
    Camera,
}

impl Capability {
    /// The capability required to produce media of `kind`.
    #[must_use]
    pub const fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Capability::Mic,
            MediaKind::Video => Capability::Camera,
        }
    }

    /// The media kind this capability gates.
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Capability::Mic => MediaKind::Audio,
            Capability::Camera => MediaKind::Video,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::Mic => "mic",
            Capability::Camera => "camera",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-participant capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub mic: bool,
    pub camera: bool,
}

impl PermissionSet {
    /// Both capabilities granted.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            mic: true,
            camera: true,
        }
    }

    /// No capability granted.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            mic: false,
            camera: false,
        }
    }

    #[must_use]
    pub const fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::Mic => self.mic,
            Capability::Camera => self.camera,
        }
    }

    /// Set a capability flag. Returns `true` when the flag actually changed.
    pub fn set(&mut self, capability: Capability, granted: bool) -> bool {
        let slot = match capability {
            Capability::Mic => &mut self.mic,
            Capability::Camera => &mut self.camera,
        };
        let changed = *slot != granted;
        *slot = granted;
        changed
    }
}

/// Direction of a media transport, from the participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Participant connection state inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Admitted, no transport connected yet.
    Joined,
    /// At least one transport connected.
    Connected,
    /// Signaling channel lost; removal pending.
    Disconnected,
}

/// Producer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerState {
    Active,
    Paused,
    Closed,
}

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Pending,
    Active,
    Paused,
    Closed,
}

/// Reference to a media producer owned by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
    pub owner_id: String,
    pub kind: MediaKind,
    pub state: ProducerState,
}

/// Reference to one participant's subscription to another's producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub state: ConsumerState,
}

/// Transport parameters returned by the media engine. ICE/DTLS payloads
/// are opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Consumer parameters returned by the media engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
}

/// Encoding quality tier for a video producer. Ordered `low < medium < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    /// Target video bitrate for the tier, in bits per second.
    #[must_use]
    pub const fn target_bitrate_bps(&self) -> u64 {
        match self {
            QualityTier::Low => 150_000,
            QualityTier::Medium => 500_000,
            QualityTier::High => 1_200_000,
        }
    }

    /// Next tier down, if any.
    #[must_use]
    pub const fn lower(&self) -> Option<Self> {
        match self {
            QualityTier::Low => None,
            QualityTier::Medium => Some(QualityTier::Low),
            QualityTier::High => Some(QualityTier::Medium),
        }
    }

    /// Next tier up, if any.
    #[must_use]
    pub const fn higher(&self) -> Option<Self> {
        match self {
            QualityTier::Low => Some(QualityTier::Medium),
            QualityTier::Medium => Some(QualityTier::High),
            QualityTier::High => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }
}

/// Room-size driven media policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalabilityPolicy {
    pub max_video_streams: u32,
    pub audio_only_recommended: bool,
    pub bandwidth_limit_kbps: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("Teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert_eq!("HOD".parse::<Role>().unwrap(), Role::Hod);
        assert_eq!(" student ".parse::<Role>().unwrap(), Role::Student);
        assert!("principal".parse::<Role>().is_err());

        let role: Role = serde_json::from_str("\"DEAN\"").unwrap();
        assert_eq!(role, Role::Dean);
        assert_eq!(serde_json::to_string(&Role::Dean).unwrap(), "\"dean\"");
    }

    #[test]
    fn test_moderator_set() {
        for role in [Role::Teacher, Role::Admin, Role::Hod, Role::Dean] {
            assert!(role.is_moderator(), "{role} should moderate");
        }
        for role in [Role::Assistant, Role::Student, Role::Guest] {
            assert!(!role.is_moderator(), "{role} should not moderate");
        }
    }

    #[test]
    fn test_capability_kind_mapping() {
        assert_eq!(Capability::for_kind(MediaKind::Audio), Capability::Mic);
        assert_eq!(Capability::for_kind(MediaKind::Video), Capability::Camera);
        assert_eq!(Capability::Camera.kind(), MediaKind::Video);
    }

    #[test]
    fn test_permission_set_reports_changes() {
        let mut perms = PermissionSet::none();
        assert!(perms.set(Capability::Camera, true));
        assert!(!perms.set(Capability::Camera, true));
        assert!(perms.allows(Capability::Camera));
        assert!(!perms.allows(Capability::Mic));
        assert!(perms.set(Capability::Camera, false));
        assert_eq!(perms, PermissionSet::none());
    }

    #[test]
    fn test_quality_tier_order_and_steps() {
        assert!(QualityTier::Low < QualityTier::Medium);
        assert!(QualityTier::Medium < QualityTier::High);
        assert_eq!(QualityTier::High.higher(), None);
        assert_eq!(QualityTier::Low.lower(), None);
        assert_eq!(QualityTier::Medium.lower(), Some(QualityTier::Low));
        assert!(
            QualityTier::Low.target_bitrate_bps() < QualityTier::High.target_bitrate_bps()
        );
    }

    #[test]
    fn test_producer_ref_wire_shape() {
        let producer = ProducerRef {
            producer_id: "p1".to_string(),
            owner_id: "alice".to_string(),
            kind: MediaKind::Video,
            state: ProducerState::Active,
        };
        let json = serde_json::to_value(&producer).unwrap();
        assert_eq!(json["producerId"], "p1");
        assert_eq!(json["ownerId"], "alice");
        assert_eq!(json["kind"], "video");
        assert_eq!(json["state"], "active");
    }
}
