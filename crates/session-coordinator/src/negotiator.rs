//! Transport, producer and consumer negotiation.
//!
//! Each operation follows the same shape: the participant's room authorizes
//! the request, the media engine is awaited outside the room actor, and the
//! result is committed back through the actor. If the commit fails (the
//! participant left, a permission was revoked meanwhile) the engine object
//! that was just created is closed again.

use crate::actors::RoomActorHandle;
use crate::errors::CoordinatorError;
use crate::media_engine::{MediaEngine, MediaEngineError};
use crate::registry::RoomRegistry;
use common::types::{
    ConsumerDescriptor, ConsumerState, MediaKind, ProducerRef, TransportDescriptor,
    TransportDirection,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Map an engine failure during transport setup.
fn transport_error(e: MediaEngineError) -> CoordinatorError {
    match e {
        MediaEngineError::NotFound(msg) => CoordinatorError::UnknownTransport(msg),
        MediaEngineError::Rejected(msg) => CoordinatorError::PermanentMedia(msg),
        MediaEngineError::Unavailable(msg) => CoordinatorError::Transport(msg),
    }
}

/// Map an engine failure during consume.
fn consume_error(e: MediaEngineError) -> CoordinatorError {
    match e {
        // The producer vanished between authorization and the engine call
        MediaEngineError::NotFound(msg) => CoordinatorError::TransientMedia(msg),
        MediaEngineError::Rejected(msg) => CoordinatorError::PermanentMedia(msg),
        MediaEngineError::Unavailable(msg) => CoordinatorError::Transport(msg),
    }
}

/// Map an engine failure on an existing consumer.
fn consumer_error(e: MediaEngineError) -> CoordinatorError {
    match e {
        MediaEngineError::NotFound(msg) => CoordinatorError::Validation(msg),
        MediaEngineError::Rejected(msg) => CoordinatorError::PermanentMedia(msg),
        MediaEngineError::Unavailable(msg) => CoordinatorError::Transport(msg),
    }
}

/// Negotiates media objects on behalf of joined participants.
#[derive(Clone)]
pub struct SessionNegotiator {
    registry: Arc<RoomRegistry>,
    engine: Arc<dyn MediaEngine>,
}

impl SessionNegotiator {
    pub fn new(registry: Arc<RoomRegistry>, engine: Arc<dyn MediaEngine>) -> Self {
        Self { registry, engine }
    }

    fn room(&self, participant_id: &str) -> Result<RoomActorHandle, CoordinatorError> {
        self.registry.room_for(participant_id)
    }

    async fn close_producer_quietly(&self, producer_id: &str) {
        if let Err(e) = self.engine.close_producer(producer_id).await {
            warn!(
                target: "sc.negotiator",
                producer_id = %producer_id,
                error = %e,
                "Failed to close producer on engine"
            );
        }
    }

    async fn close_consumer_quietly(&self, consumer_id: &str) {
        if let Err(e) = self.engine.close_consumer(consumer_id).await {
            warn!(
                target: "sc.negotiator",
                consumer_id = %consumer_id,
                error = %e,
                "Failed to close consumer on engine"
            );
        }
    }

    async fn close_transport_quietly(&self, transport_id: &str) {
        if let Err(e) = self.engine.close_transport(transport_id).await {
            warn!(
                target: "sc.negotiator",
                transport_id = %transport_id,
                error = %e,
                "Failed to close transport on engine"
            );
        }
    }

    /// Create a transport for a joined participant.
    ///
    /// A second transport in the same direction replaces the first, which is
    /// closed along with anything riding on it. Engine failures are never
    /// retried here; the caller requests a fresh transport.
    ///
    /// # Errors
    ///
    /// `UnknownParticipant` if not joined, `Transport` on engine failure.
    #[instrument(skip_all, fields(participant_id = %participant_id, direction = direction.as_str()))]
    pub async fn request_transport(
        &self,
        participant_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, CoordinatorError> {
        let room = self.room(participant_id)?;
        room.check_member(participant_id).await?;

        let descriptor = self
            .engine
            .create_transport(room.room_id(), direction)
            .await
            .map_err(|e| CoordinatorError::Transport(e.to_string()))?;

        let replacement = match room
            .record_transport(participant_id, &descriptor.transport_id, direction)
            .await
        {
            Ok(replacement) => replacement,
            Err(e) => {
                debug!(
                    target: "sc.negotiator",
                    transport_id = %descriptor.transport_id,
                    "Participant gone before transport commit, closing orphan"
                );
                self.close_transport_quietly(&descriptor.transport_id).await;
                return Err(e);
            }
        };

        for producer in &replacement.closed_producers {
            self.close_producer_quietly(&producer.producer_id).await;
        }
        if let Some(old) = &replacement.replaced {
            self.close_transport_quietly(old).await;
        }

        info!(
            target: "sc.negotiator",
            participant_id = %participant_id,
            transport_id = %descriptor.transport_id,
            direction = direction.as_str(),
            replaced = replacement.replaced.is_some(),
            "Transport created"
        );
        Ok(descriptor)
    }

    /// Complete DTLS for one of the participant's transports.
    ///
    /// # Errors
    ///
    /// `UnknownTransport` if the caller does not own it, `Transport` if the
    /// engine fails.
    #[instrument(skip_all, fields(participant_id = %participant_id, transport_id = %transport_id))]
    pub async fn connect_transport(
        &self,
        participant_id: &str,
        transport_id: &str,
        dtls_parameters: serde_json::Value,
    ) -> Result<(), CoordinatorError> {
        let room = self.room(participant_id)?;
        room.transport_direction(participant_id, transport_id).await?;

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await
            .map_err(transport_error)?;

        room.transport_connected(participant_id, transport_id).await
    }

    /// Start producing `kind` on a send transport.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` without the capability (checked before and after
    /// the engine call), `Validation` if already producing that kind.
    #[instrument(skip_all, fields(participant_id = %participant_id, kind = kind.as_str()))]
    pub async fn produce(
        &self,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerRef, CoordinatorError> {
        let room = self.room(participant_id)?;
        room.authorize_produce(participant_id, transport_id, kind)
            .await?;

        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await
            .map_err(transport_error)?;

        match room
            .producer_created(participant_id, transport_id, &producer_id, kind)
            .await
        {
            Ok(producer) => Ok(producer),
            Err(e) => {
                warn!(
                    target: "sc.negotiator",
                    participant_id = %participant_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Producer commit rejected, closing"
                );
                self.close_producer_quietly(&producer_id).await;
                Err(e)
            }
        }
    }

    /// Close one of the participant's producers.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` if the caller does not own it.
    #[instrument(skip_all, fields(participant_id = %participant_id, producer_id = %producer_id))]
    pub async fn close_producer(
        &self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<(), CoordinatorError> {
        let room = self.room(participant_id)?;
        room.close_producer(participant_id, producer_id).await?;
        self.close_producer_quietly(producer_id).await;
        Ok(())
    }

    /// Consume another participant's producer on the caller's receive
    /// transport. The consumer starts paused.
    ///
    /// # Errors
    ///
    /// `TransientMedia` if the producer is unknown or closed meanwhile,
    /// `PermanentMedia` if the engine rejects the capabilities, `Validation`
    /// if the caller already consumes the producer.
    #[instrument(skip_all, fields(participant_id = %participant_id, producer_id = %producer_id))]
    pub async fn consume(
        &self,
        participant_id: &str,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, CoordinatorError> {
        let room = self.room(participant_id)?;
        let ticket = room.authorize_consume(participant_id, producer_id).await?;

        let descriptor = self
            .engine
            .consume(&ticket.transport_id, producer_id, rtp_capabilities)
            .await
            .map_err(consume_error)?;

        if let Err(e) = room
            .consumer_created(participant_id, &ticket.transport_id, descriptor.clone())
            .await
        {
            warn!(
                target: "sc.negotiator",
                participant_id = %participant_id,
                consumer_id = %descriptor.consumer_id,
                error = %e,
                "Consumer commit rejected, closing"
            );
            self.close_consumer_quietly(&descriptor.consumer_id).await;
            return Err(e);
        }

        debug!(
            target: "sc.negotiator",
            participant_id = %participant_id,
            producer_id = %producer_id,
            consumer_id = %descriptor.consumer_id,
            owner_id = %ticket.owner_id,
            "Consumer created"
        );
        Ok(descriptor)
    }

    /// Pause or resume one of the caller's consumers.
    ///
    /// The room records the new state first; an engine failure rolls it back.
    ///
    /// # Errors
    ///
    /// `Validation` for an unknown consumer.
    #[instrument(skip_all, fields(participant_id = %participant_id, consumer_id = %consumer_id, paused = paused))]
    pub async fn set_consumer_paused(
        &self,
        participant_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> Result<(), CoordinatorError> {
        let room = self.room(participant_id)?;
        let target = if paused {
            ConsumerState::Paused
        } else {
            ConsumerState::Active
        };
        let previous = room
            .update_consumer_state(participant_id, consumer_id, target)
            .await?;

        let result = if paused {
            self.engine.pause_consumer(consumer_id).await
        } else {
            self.engine.resume_consumer(consumer_id).await
        };
        if let Err(e) = result {
            warn!(
                target: "sc.negotiator",
                consumer_id = %consumer_id,
                error = %e,
                "Engine consumer update failed, rolling back"
            );
            let _ = room
                .update_consumer_state(participant_id, consumer_id, previous)
                .await;
            return Err(consumer_error(e));
        }
        Ok(())
    }

    /// Send the current producer list to the caller.
    ///
    /// # Errors
    ///
    /// `UnknownParticipant` if not joined.
    pub async fn request_producer_list(&self, participant_id: &str) -> Result<(), CoordinatorError> {
        self.room(participant_id)?
            .publish_producer_list(Some(participant_id))
            .await
    }
}
