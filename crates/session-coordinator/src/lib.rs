//! Session Coordinator Library
//!
//! Signaling-plane coordinator for live classroom sessions. It is
//! responsible for:
//!
//! - Room lifecycle: one actor per live class room, created on first join
//!   and reclaimed when the last participant leaves
//! - Admission: schedule gate, waiting room and moderator approval
//! - Capability control: mic/camera grants, revocation force-closes media
//! - Media negotiation against an external SFU-style media engine
//! - The authoritative producer list, announced and periodically republished
//! - Quality adaptation: simulcast tiers and degraded-link consumer pausing
//!
//! # Architecture
//!
//! ```text
//! signaling (WebSocket, one task per connection)
//! ├── SessionNegotiator    transports / producers / consumers
//! ├── PermissionController approvals / grants / media state
//! └── RoomRegistry         room_id -> RoomActor, membership index, supervisor
//!     └── RoomActor        owns one room's state
//!         └── QualityAdapter
//! ```
//!
//! Notifications flow back to participants through the
//! [`presence::PresenceGateway`], which maps participant ids to the outbound
//! queue of their connection.
//!
//! # Modules
//!
//! - [`actors`] - Room actor, its messages and mailbox metrics
//! - [`registry`] - Room registry and supervisor
//! - [`negotiator`] - Media negotiation
//! - [`permissions`] - Moderator actions
//! - [`signaling`] - WebSocket endpoint
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types and their wire categories

pub mod actors;
pub mod admission;
pub mod config;
pub mod errors;
pub mod media_engine;
pub mod negotiator;
pub mod observability;
pub mod permissions;
pub mod persistence;
pub mod presence;
pub mod producers;
pub mod quality;
pub mod registry;
pub mod signaling;
