//! Client error type.

use common::error::ErrorCategory;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Device or receive transport not ready; nothing was sent.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The coordinator answered with an `error` frame.
    #[error("{category}: {message}")]
    Coordinator {
        category: ErrorCategory,
        message: String,
    },

    /// The signaling connection is gone.
    #[error("connection closed")]
    Disconnected,
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::NotReady(_) => ErrorCategory::Validation,
            ClientError::Coordinator { category, .. } => *category,
            ClientError::Disconnected => ErrorCategory::Unavailable,
        }
    }

    /// Only the producer-not-found race is retried.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn coordinator(category: ErrorCategory, message: impl Into<String>) -> Self {
        ClientError::Coordinator {
            category,
            message: message.into(),
        }
    }
}
