//! Seam between the retry engine and the signaling connection.

use crate::errors::ClientError;
use async_trait::async_trait;
use common::types::ConsumerDescriptor;

/// The three requests the receive path makes of the coordinator and the
/// local media stack.
#[async_trait]
pub trait ConsumeBackend: Send + Sync {
    /// Ask the coordinator for a consumer of `producer_id`.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &serde_json::Value,
    ) -> Result<ConsumerDescriptor, ClientError>;

    /// Start playback. Consumers are created paused.
    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), ClientError>;

    /// Stop local playback and release the consumer.
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), ClientError>;
}

/// Scripted backend for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use common::types::MediaKind;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Returns scripted results per producer id, then succeeds.
    #[derive(Default)]
    pub struct MockConsumeBackend {
        scripts: Mutex<HashMap<String, VecDeque<Result<(), ClientError>>>>,
        consume_calls: Mutex<Vec<(String, Instant)>>,
        resumed: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
    }

    impl MockConsumeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue `results` for consecutive consume calls on `producer_id`.
        pub fn script(&self, producer_id: &str, results: Vec<Result<(), ClientError>>) {
            self.scripts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(producer_id.to_string())
                .or_default()
                .extend(results);
        }

        /// Make every consume of `producer_id` fail with "producer not found".
        pub fn always_missing(&self, producer_id: &str, times: usize) {
            let missing = ClientError::coordinator(
                common::error::ErrorCategory::TransientMedia,
                "producer not found",
            );
            self.script(producer_id, vec![Err(missing); times]);
        }

        pub fn consume_count(&self, producer_id: &str) -> usize {
            self.consume_times(producer_id).len()
        }

        /// When each consume of `producer_id` was issued.
        pub fn consume_times(&self, producer_id: &str) -> Vec<Instant> {
            self.consume_calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .filter(|(id, _)| id == producer_id)
                .map(|(_, at)| *at)
                .collect()
        }

        pub fn resumed(&self) -> Vec<String> {
            self.resumed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        pub fn closed(&self) -> Vec<String> {
            self.closed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl ConsumeBackend for MockConsumeBackend {
        async fn consume(
            &self,
            producer_id: &str,
            _rtp_capabilities: &serde_json::Value,
        ) -> Result<ConsumerDescriptor, ClientError> {
            self.consume_calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((producer_id.to_string(), Instant::now()));
            let scripted = self
                .scripts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get_mut(producer_id)
                .and_then(VecDeque::pop_front);
            scripted.unwrap_or(Ok(()))?;

            let attempt = self.consume_count(producer_id);
            Ok(ConsumerDescriptor {
                consumer_id: format!("consumer-{producer_id}-{attempt}"),
                producer_id: producer_id.to_string(),
                kind: MediaKind::Video,
                rtp_parameters: serde_json::json!({}),
            })
        }

        async fn resume_consumer(&self, consumer_id: &str) -> Result<(), ClientError> {
            self.resumed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(consumer_id.to_string());
            Ok(())
        }

        async fn close_consumer(&self, consumer_id: &str) -> Result<(), ClientError> {
            self.closed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(consumer_id.to_string());
            Ok(())
        }
    }
}
