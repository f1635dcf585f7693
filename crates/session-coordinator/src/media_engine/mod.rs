//! Media engine abstraction.
//!
//! The coordinator never touches RTP. Routers, transports, producers and
//! consumers live in an external SFU process; the coordinator drives it
//! through [`MediaEngine`] and treats every descriptor it returns as opaque.
//!
//! [`HttpMediaEngine`] talks to the SFU's HTTP control API. The in-memory
//! [`mock::MockMediaEngine`] backs unit and integration tests.

mod http;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use http::HttpMediaEngine;

use common::types::{ConsumerDescriptor, MediaKind, TransportDescriptor, TransportDirection};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Media engine failure, classified by what the caller can do about it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaEngineError {
    /// The referenced router, transport, producer or consumer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Parameters were malformed or incompatible. Retrying cannot help.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Engine unreachable, timed out or failed internally.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl MediaEngineError {
    /// Bounded label for the `kind` metric dimension.
    pub fn kind_label(&self) -> &'static str {
        match self {
            MediaEngineError::NotFound(_) => "not_found",
            MediaEngineError::Rejected(_) => "rejected",
            MediaEngineError::Unavailable(_) => "unavailable",
        }
    }
}

/// One statistics sample for a producer or consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStats {
    /// Observed bitrate in bits per second.
    pub bitrate_bps: u64,
    /// Packet loss fraction in [0, 1].
    #[serde(default)]
    pub packet_loss: f64,
    /// Interarrival jitter in milliseconds.
    #[serde(default)]
    pub jitter_ms: f64,
    /// Round-trip time in milliseconds.
    #[serde(default)]
    pub rtt_ms: f64,
}

/// Control surface of the external SFU.
///
/// Implementations must be cheap to share (`Arc<dyn MediaEngine>`) and
/// safe to call concurrently from many room actors.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router RTP capabilities for the room, created on first use.
    async fn router_rtp_capabilities(
        &self,
        room_id: &str,
    ) -> Result<serde_json::Value, MediaEngineError>;

    async fn create_transport(
        &self,
        room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, MediaEngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: serde_json::Value,
    ) -> Result<(), MediaEngineError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaEngineError>;

    /// Create a producer on a send transport. Returns the producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<String, MediaEngineError>;

    /// Create a paused consumer on a receive transport.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, MediaEngineError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError>;

    /// Close a producer. Consumers of it are closed by the engine.
    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaEngineError>;

    /// Close a single consumer.
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError>;

    /// Latest statistics for a producer or consumer id.
    async fn get_stats(&self, object_id: &str) -> Result<MediaStats, MediaEngineError>;
}
