//! Categorized error reasons.
//!
//! Every failure that crosses the signaling channel is reduced to an
//! [`ErrorCategory`]. The category is the stable, user-visible reason string;
//! human-readable messages may change, categories may not.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error category carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown room, participant or transport, or a malformed request.
    Validation,
    /// Producer-not-found race between teardown and consumption.
    TransientMedia,
    /// Malformed descriptor or capability mismatch reported by the media engine.
    PermanentMedia,
    /// Capability action attempted without the required role or grant.
    PermissionDenied,
    /// Room or service at capacity.
    CapacityExceeded,
    /// Media engine failed while creating or connecting a transport.
    Transport,
    /// A dependency (persistence, media engine) is temporarily unreachable.
    Unavailable,
    /// Anything else. Details stay in server logs.
    Internal,
}

impl ErrorCategory {
    /// Wire string for this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::TransientMedia => "transient_media",
            ErrorCategory::PermanentMedia => "permanent_media",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::CapacityExceeded => "capacity_exceeded",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Internal => "internal",
        }
    }

    /// Only the producer-not-found race is worth retrying automatically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::TransientMedia)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strings_match_serde() {
        let all = [
            ErrorCategory::Validation,
            ErrorCategory::TransientMedia,
            ErrorCategory::PermanentMedia,
            ErrorCategory::PermissionDenied,
            ErrorCategory::CapacityExceeded,
            ErrorCategory::Transport,
            ErrorCategory::Unavailable,
            ErrorCategory::Internal,
        ];

        for category in all {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn test_only_transient_media_is_retryable() {
        assert!(ErrorCategory::TransientMedia.is_retryable());
        assert!(!ErrorCategory::PermanentMedia.is_retryable());
        assert!(!ErrorCategory::PermissionDenied.is_retryable());
        assert!(!ErrorCategory::Transport.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
    }
}
