//! In-memory media engine for tests.
//!
//! Keeps just enough SFU bookkeeping to make the coordinator's checks
//! meaningful: producers must exist to be consumed, produce requires a
//! send transport, closed producers are remembered in order.

use super::{MediaEngine, MediaEngineError, MediaStats};
use common::types::{ConsumerDescriptor, MediaKind, TransportDescriptor, TransportDirection};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MockState {
    next_id: u64,
    transports: HashMap<String, TransportDirection>,
    producers: HashMap<String, MediaKind>,
    consumers: HashMap<String, String>,
    paused_consumers: HashSet<String>,
    closed_producers: Vec<String>,
    closed_transports: Vec<String>,
    closed_consumers: Vec<String>,
    stats: HashMap<String, VecDeque<MediaStats>>,
    failures: HashMap<&'static str, MediaEngineError>,
    call_counts: HashMap<&'static str, usize>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&mut self, operation: &'static str) -> Result<(), MediaEngineError> {
        *self.call_counts.entry(operation).or_insert(0) += 1;
        match self.failures.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Mock media engine for unit and integration testing.
#[derive(Default)]
pub struct MockMediaEngine {
    state: Mutex<MockState>,
}

impl MockMediaEngine {
    /// Create an engine where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call to `operation` fail with `error` until cleared.
    ///
    /// Operation names match the trait method names (`"consume"`,
    /// `"create_transport"`, ...).
    pub fn fail(&self, operation: &'static str, error: MediaEngineError) {
        self.state().failures.insert(operation, error);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.state().failures.remove(operation);
    }

    /// Queue a stats sample for a producer or consumer. Samples are
    /// returned in order; the last one repeats.
    pub fn push_stats(&self, object_id: &str, stats: MediaStats) {
        self.state()
            .stats
            .entry(object_id.to_string())
            .or_default()
            .push_back(stats);
    }

    /// Register a producer that was created outside the coordinator.
    pub fn insert_producer(&self, producer_id: &str, kind: MediaKind) {
        self.state().producers.insert(producer_id.to_string(), kind);
    }

    /// Producer ids closed so far, in close order.
    pub fn closed_producers(&self) -> Vec<String> {
        self.state().closed_producers.clone()
    }

    /// Transport ids closed so far, in close order.
    pub fn closed_transports(&self) -> Vec<String> {
        self.state().closed_transports.clone()
    }

    pub fn is_producer_live(&self, producer_id: &str) -> bool {
        self.state().producers.contains_key(producer_id)
    }

    /// Consumer ids closed individually so far, in close order.
    pub fn closed_consumers(&self) -> Vec<String> {
        self.state().closed_consumers.clone()
    }

    /// Consumers currently open on the engine.
    pub fn live_consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn is_consumer_paused(&self, consumer_id: &str) -> bool {
        self.state().paused_consumers.contains(consumer_id)
    }

    /// Number of calls made to `operation`, including failed ones.
    pub fn call_count(&self, operation: &str) -> usize {
        self.state()
            .call_counts
            .get(operation)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    async fn router_rtp_capabilities(
        &self,
        room_id: &str,
    ) -> Result<serde_json::Value, MediaEngineError> {
        let mut state = self.state();
        state.enter("router_rtp_capabilities")?;
        Ok(json!({
            "router": room_id,
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ]
        }))
    }

    async fn create_transport(
        &self,
        _room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, MediaEngineError> {
        let mut state = self.state();
        state.enter("create_transport")?;
        let transport_id = state.next_id("transport");
        state.transports.insert(transport_id.clone(), direction);
        Ok(TransportDescriptor {
            transport_id,
            direction,
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: serde_json::Value,
    ) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("connect_transport")?;
        if state.transports.contains_key(transport_id) {
            Ok(())
        } else {
            Err(MediaEngineError::NotFound(format!("transport {transport_id}")))
        }
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("close_transport")?;
        if state.transports.remove(transport_id).is_some() {
            state.closed_transports.push(transport_id.to_string());
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        _rtp_parameters: serde_json::Value,
    ) -> Result<String, MediaEngineError> {
        let mut state = self.state();
        state.enter("produce")?;
        match state.transports.get(transport_id) {
            Some(TransportDirection::Send) => {}
            Some(TransportDirection::Recv) => {
                return Err(MediaEngineError::Rejected(
                    "cannot produce on a receive transport".to_string(),
                ))
            }
            None => return Err(MediaEngineError::NotFound(format!("transport {transport_id}"))),
        }
        let producer_id = state.next_id("producer");
        state.producers.insert(producer_id.clone(), kind);
        Ok(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, MediaEngineError> {
        let mut state = self.state();
        state.enter("consume")?;
        if !state.transports.contains_key(transport_id) {
            return Err(MediaEngineError::NotFound(format!("transport {transport_id}")));
        }
        let kind = *state
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaEngineError::NotFound(format!("producer {producer_id}")))?;

        let consumer_id = state.next_id("consumer");
        state
            .consumers
            .insert(consumer_id.clone(), producer_id.to_string());
        state.paused_consumers.insert(consumer_id.clone());
        Ok(ConsumerDescriptor {
            consumer_id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters: json!({ "codecs": [], "encodings": [] }),
        })
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("pause_consumer")?;
        if !state.consumers.contains_key(consumer_id) {
            return Err(MediaEngineError::NotFound(format!("consumer {consumer_id}")));
        }
        state.paused_consumers.insert(consumer_id.to_string());
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("resume_consumer")?;
        if !state.consumers.contains_key(consumer_id) {
            return Err(MediaEngineError::NotFound(format!("consumer {consumer_id}")));
        }
        state.paused_consumers.remove(consumer_id);
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("close_producer")?;
        if state.producers.remove(producer_id).is_some() {
            state.closed_producers.push(producer_id.to_string());
            state.consumers.retain(|_, p| p != producer_id);
        }
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let mut state = self.state();
        state.enter("close_consumer")?;
        if state.consumers.remove(consumer_id).is_some() {
            state.paused_consumers.remove(consumer_id);
            state.closed_consumers.push(consumer_id.to_string());
        }
        Ok(())
    }

    async fn get_stats(&self, object_id: &str) -> Result<MediaStats, MediaEngineError> {
        let mut state = self.state();
        state.enter("get_stats")?;
        let queue = state
            .stats
            .get_mut(object_id)
            .ok_or_else(|| MediaEngineError::NotFound(format!("no stats for {object_id}")))?;
        let sample = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        sample.ok_or_else(|| MediaEngineError::NotFound(format!("no stats for {object_id}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consume_requires_live_producer() {
        let engine = MockMediaEngine::new();
        let send = engine
            .create_transport("r", TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_transport("r", TransportDirection::Recv)
            .await
            .unwrap();

        let producer_id = engine
            .produce(&send.transport_id, MediaKind::Audio, json!({}))
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.transport_id, &producer_id, json!({}))
            .await
            .unwrap();
        assert!(engine.is_consumer_paused(&consumer.consumer_id));

        engine.close_producer(&producer_id).await.unwrap();
        let err = engine
            .consume(&recv.transport_id, &producer_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaEngineError::NotFound(_)));
        assert_eq!(engine.closed_producers(), vec![producer_id]);
    }

    #[tokio::test]
    async fn test_injected_failures_and_call_counts() {
        let engine = MockMediaEngine::new();
        engine.fail(
            "create_transport",
            MediaEngineError::Unavailable("down".to_string()),
        );

        assert!(engine
            .create_transport("r", TransportDirection::Send)
            .await
            .is_err());
        engine.clear_failure("create_transport");
        assert!(engine
            .create_transport("r", TransportDirection::Send)
            .await
            .is_ok());
        assert_eq!(engine.call_count("create_transport"), 2);
    }

    #[tokio::test]
    async fn test_stats_queue_repeats_last_sample() {
        let engine = MockMediaEngine::new();
        engine.push_stats("p1", MediaStats { bitrate_bps: 1, ..MediaStats::default() });
        engine.push_stats("p1", MediaStats { bitrate_bps: 2, ..MediaStats::default() });

        assert_eq!(engine.get_stats("p1").await.unwrap().bitrate_bps, 1);
        assert_eq!(engine.get_stats("p1").await.unwrap().bitrate_bps, 2);
        assert_eq!(engine.get_stats("p1").await.unwrap().bitrate_bps, 2);
        assert!(engine.get_stats("p2").await.is_err());
    }
}
