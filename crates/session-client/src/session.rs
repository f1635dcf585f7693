//! Participant-side message handling.
//!
//! Feeds coordinator pushes into the [`ProducerCache`] and keeps the
//! [`ConsumerRetryEngine`] consuming exactly the producers the cache holds.

use crate::consumer::{ConsumerRetryEngine, Readiness};
use crate::errors::ClientError;
use crate::reconcile::{ProducerCache, ReconcilePlan};
use common::signaling::ServerMessage;
use common::types::{MediaKind, ProducerRef, ProducerState};
use tokio::sync::watch;
use tracing::{debug, instrument};

pub struct ParticipantSession {
    participant_id: Option<String>,
    cache: ProducerCache,
    engine: ConsumerRetryEngine,
    readiness: watch::Sender<Readiness>,
}

impl ParticipantSession {
    /// `readiness` must be the sender paired with the engine's receiver.
    pub fn new(engine: ConsumerRetryEngine, readiness: watch::Sender<Readiness>) -> Self {
        Self {
            participant_id: None,
            cache: ProducerCache::new(),
            engine,
            readiness,
        }
    }

    pub fn participant_id(&self) -> Option<&str> {
        self.participant_id.as_deref()
    }

    pub fn cache(&self) -> &ProducerCache {
        &self.cache
    }

    pub fn engine(&self) -> &ConsumerRetryEngine {
        &self.engine
    }

    /// Update device/transport readiness. Producers seen while not ready
    /// are consumed once both flags hold.
    ///
    /// # Errors
    ///
    /// Propagates consume validation failures.
    pub fn set_readiness(&mut self, readiness: Readiness) -> Result<(), ClientError> {
        self.readiness.send_replace(readiness);
        if readiness.is_ready() {
            self.consume_missing()?;
        }
        Ok(())
    }

    /// Apply one coordinator message. Messages outside the receive path
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Propagates consume validation failures.
    pub async fn handle_server_message(
        &mut self,
        message: &ServerMessage,
    ) -> Result<(), ClientError> {
        match message {
            ServerMessage::JoinResponse {
                participant_id,
                rtp_capabilities,
                existing_producers,
                revision,
                ..
            } => {
                self.participant_id = Some(participant_id.clone());
                self.cache.set_self(participant_id.clone());
                self.engine.set_rtp_capabilities(rtp_capabilities.clone());
                self.reconcile(*revision, existing_producers.clone()).await
            }
            ServerMessage::NewProducer {
                producer_id,
                peer_id,
                kind,
            } => {
                let producer = ProducerRef {
                    producer_id: producer_id.clone(),
                    owner_id: peer_id.clone(),
                    kind: *kind,
                    state: ProducerState::Active,
                };
                self.cache.insert(producer);
                // A fresh announcement earns a failed producer another try
                self.engine.forget_failure(producer_id);
                if self.cache.contains(producer_id) && !self.engine.is_tracking(producer_id) {
                    self.try_consume(peer_id, producer_id, *kind)?;
                }
                Ok(())
            }
            ServerMessage::ProducerClosed { producer_id, .. } => {
                self.cache.remove(producer_id);
                self.engine.on_producer_closed(producer_id).await;
                Ok(())
            }
            ServerMessage::ProducerListUpdate {
                revision,
                producers,
            } => self.reconcile(*revision, producers.clone()).await,
            _ => Ok(()),
        }
    }

    /// Release every remote track, e.g. after leaving the room.
    pub async fn leave(&mut self) {
        self.engine.release_all().await;
        self.cache = ProducerCache::new();
        self.participant_id = None;
    }

    #[instrument(skip_all, fields(revision = revision))]
    async fn reconcile(
        &mut self,
        revision: u64,
        producers: Vec<ProducerRef>,
    ) -> Result<(), ClientError> {
        let Some(plan) = self.cache.apply_snapshot(revision, producers) else {
            debug!(target: "sc.client.reconcile", "Ignoring stale producer list");
            return Ok(());
        };
        let ReconcilePlan { teardown, consume } = &plan;
        debug!(
            target: "sc.client.reconcile",
            teardown = teardown.len(),
            consume = consume.len(),
            "Applying producer list"
        );

        for producer_id in teardown {
            self.engine.release(producer_id).await;
        }
        self.consume_missing()
    }

    /// Consume every cached producer the engine is neither handling nor
    /// holding as failed.
    fn consume_missing(&self) -> Result<(), ClientError> {
        if !self.engine.is_ready() {
            return Ok(());
        }
        for producer in self.cache.producers() {
            if !self.engine.is_tracking(&producer.producer_id)
                && !self.engine.has_failed(&producer.producer_id)
            {
                self.engine
                    .consume(&producer.owner_id, &producer.producer_id, producer.kind)?;
            }
        }
        Ok(())
    }

    fn try_consume(
        &self,
        peer_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<(), ClientError> {
        if !self.engine.is_ready() {
            debug!(
                target: "sc.client.reconcile",
                producer_id = %producer_id,
                "Not ready, deferring consume"
            );
            return Ok(());
        }
        self.engine.consume(peer_id, producer_id, kind)
    }
}
