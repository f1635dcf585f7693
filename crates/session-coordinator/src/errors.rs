//! Session coordinator error types.
//!
//! Every variant reduces to an [`ErrorCategory`] for the signaling channel.
//! Internal details are logged server-side but not exposed to participants.

use common::error::ErrorCategory;
use thiserror::Error;

/// Session coordinator error type.
///
/// Maps to wire categories:
/// - Unknown room / participant / transport, `Validation`, `Conflict`,
///   `RoomClosed`: `validation`
/// - `TransientMedia`: `transient_media` (the only retryable category)
/// - `PermanentMedia`: `permanent_media`
/// - `PermissionDenied`: `permission_denied`
/// - `CapacityExceeded`: `capacity_exceeded`
/// - `Transport`: `transport`
/// - `PersistenceUnavailable`, `Draining`: `unavailable`
/// - `Internal`: `internal`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Malformed or out-of-order request.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Room does not exist on this coordinator.
    #[error("Room not found: {0}")]
    UnknownRoom(String),

    /// Participant is not a member of any room (or not of this room).
    #[error("Participant not found: {0}")]
    UnknownParticipant(String),

    /// Transport id not owned by the requesting participant.
    #[error("Transport not found: {0}")]
    UnknownTransport(String),

    /// Producer not found or recently closed; the consumer may retry.
    #[error("Producer unavailable: {0}")]
    TransientMedia(String),

    /// Media engine rejected the parameters; retrying cannot help.
    #[error("Media rejected: {0}")]
    PermanentMedia(String),

    /// Role or grant does not allow the action.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Room or coordinator at capacity.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Media engine failed while creating or connecting a transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Conflicting membership (already in this or another room).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room actor has stopped; the registry evicts and retries once.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Class record store unreachable while loading room policy.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// Coordinator is shutting down and accepts no new rooms.
    #[error("Coordinator is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Wire category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordinatorError::Validation(_)
            | CoordinatorError::UnknownRoom(_)
            | CoordinatorError::UnknownParticipant(_)
            | CoordinatorError::UnknownTransport(_)
            | CoordinatorError::Conflict(_)
            | CoordinatorError::RoomClosed(_) => ErrorCategory::Validation,
            CoordinatorError::TransientMedia(_) => ErrorCategory::TransientMedia,
            CoordinatorError::PermanentMedia(_) => ErrorCategory::PermanentMedia,
            CoordinatorError::PermissionDenied(_) => ErrorCategory::PermissionDenied,
            CoordinatorError::CapacityExceeded(_) => ErrorCategory::CapacityExceeded,
            CoordinatorError::Transport(_) => ErrorCategory::Transport,
            CoordinatorError::PersistenceUnavailable(_) | CoordinatorError::Draining => {
                ErrorCategory::Unavailable
            }
            CoordinatorError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Bounded label for the `error_type` metric dimension.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            CoordinatorError::Validation(_) => "validation",
            CoordinatorError::UnknownRoom(_) => "unknown_room",
            CoordinatorError::UnknownParticipant(_) => "unknown_participant",
            CoordinatorError::UnknownTransport(_) => "unknown_transport",
            CoordinatorError::TransientMedia(_) => "transient_media",
            CoordinatorError::PermanentMedia(_) => "permanent_media",
            CoordinatorError::PermissionDenied(_) => "permission_denied",
            CoordinatorError::CapacityExceeded(_) => "capacity_exceeded",
            CoordinatorError::Transport(_) => "transport",
            CoordinatorError::Conflict(_) => "conflict",
            CoordinatorError::RoomClosed(_) => "room_closed",
            CoordinatorError::PersistenceUnavailable(_) => "persistence_unavailable",
            CoordinatorError::Draining => "draining",
            CoordinatorError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CoordinatorError::Validation(msg)
            | CoordinatorError::Conflict(msg)
            | CoordinatorError::PermissionDenied(msg)
            | CoordinatorError::CapacityExceeded(msg) => msg.clone(),
            CoordinatorError::UnknownRoom(_) => "Room not found".to_string(),
            CoordinatorError::UnknownParticipant(_) => {
                "Participant is not in a room".to_string()
            }
            CoordinatorError::UnknownTransport(_) => "Transport not found".to_string(),
            CoordinatorError::TransientMedia(_) => "Producer not found".to_string(),
            CoordinatorError::PermanentMedia(_) => {
                "Media parameters were rejected".to_string()
            }
            CoordinatorError::Transport(_) => {
                "Transport negotiation failed, request a new transport".to_string()
            }
            CoordinatorError::RoomClosed(_) => "Room is closed".to_string(),
            CoordinatorError::PersistenceUnavailable(_) => {
                "Class information is temporarily unavailable, please retry".to_string()
            }
            CoordinatorError::Draining => "Server is shutting down, please reconnect".to_string(),
            CoordinatorError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        let cases = [
            (
                CoordinatorError::Validation("bad".to_string()),
                ErrorCategory::Validation,
            ),
            (
                CoordinatorError::UnknownRoom("r1".to_string()),
                ErrorCategory::Validation,
            ),
            (
                CoordinatorError::UnknownParticipant("s1".to_string()),
                ErrorCategory::Validation,
            ),
            (
                CoordinatorError::UnknownTransport("t1".to_string()),
                ErrorCategory::Validation,
            ),
            (
                CoordinatorError::Conflict("dup".to_string()),
                ErrorCategory::Validation,
            ),
            (
                CoordinatorError::TransientMedia("p1".to_string()),
                ErrorCategory::TransientMedia,
            ),
            (
                CoordinatorError::PermanentMedia("codec".to_string()),
                ErrorCategory::PermanentMedia,
            ),
            (
                CoordinatorError::PermissionDenied("no".to_string()),
                ErrorCategory::PermissionDenied,
            ),
            (
                CoordinatorError::CapacityExceeded("full".to_string()),
                ErrorCategory::CapacityExceeded,
            ),
            (
                CoordinatorError::Transport("ice".to_string()),
                ErrorCategory::Transport,
            ),
            (
                CoordinatorError::PersistenceUnavailable("redis".to_string()),
                ErrorCategory::Unavailable,
            ),
            (CoordinatorError::Draining, ErrorCategory::Unavailable),
            (
                CoordinatorError::Internal("boom".to_string()),
                ErrorCategory::Internal,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.category(), expected, "wrong category for {error}");
        }
    }

    #[test]
    fn test_only_transient_media_is_retryable() {
        assert!(CoordinatorError::TransientMedia("p1".to_string())
            .category()
            .is_retryable());
        assert!(!CoordinatorError::PermanentMedia("p1".to_string())
            .category()
            .is_retryable());
        assert!(!CoordinatorError::Transport("t1".to_string())
            .category()
            .is_retryable());
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = CoordinatorError::PersistenceUnavailable(
            "connection refused at 10.0.0.7:6379".to_string(),
        );
        assert!(!err.client_message().contains("10.0.0.7"));

        let err = CoordinatorError::Transport("engine returned 503 from sfu-3".to_string());
        assert!(!err.client_message().contains("sfu-3"));

        let err = CoordinatorError::Internal("mailbox dropped".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_explicit_reasons_are_passed_through() {
        let err = CoordinatorError::CapacityExceeded("room is full (500 participants)".to_string());
        assert_eq!(err.client_message(), "room is full (500 participants)");

        let err = CoordinatorError::PermissionDenied("camera not granted".to_string());
        assert_eq!(err.client_message(), "camera not granted");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CoordinatorError::UnknownRoom("class-9".to_string())),
            "Room not found: class-9"
        );
        assert_eq!(
            format!("{}", CoordinatorError::Draining),
            "Coordinator is draining"
        );
    }
}
