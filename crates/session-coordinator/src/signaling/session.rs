//! Per-connection request dispatch.

use super::SignalingState;
use crate::actors::{JoinOutcome, JoinRequest, LeaveReason};
use crate::errors::CoordinatorError;
use crate::observability::metrics;
use crate::presence::OutboundSender;
use common::signaling::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Who this connection speaks for, once `joinRoom` succeeded.
#[derive(Debug, Clone)]
struct Identity {
    participant_id: String,
    room_id: String,
}

/// State of one signaling connection.
///
/// A connection speaks for at most one participant at a time. Until it has
/// joined (or queued in a waiting room) every other request is rejected.
pub struct SignalingSession {
    state: Arc<SignalingState>,
    connection_id: String,
    outbound: OutboundSender,
    identity: Option<Identity>,
}

impl SignalingSession {
    pub fn new(state: Arc<SignalingState>, connection_id: String, outbound: OutboundSender) -> Self {
        Self {
            state,
            connection_id,
            outbound,
            identity: None,
        }
    }

    /// Participant this connection currently speaks for.
    pub fn participant_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.participant_id.as_str())
    }

    /// Handle one decoded request and produce its reply.
    pub async fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        let message_type = message.message_type();
        let start = Instant::now();

        let result = self.dispatch(message).await;
        metrics::record_message_latency(message_type, start.elapsed());

        match result {
            Ok(reply) => reply,
            Err(e) => {
                metrics::record_error(message_type, e.error_type_label());
                debug!(
                    target: "sc.signaling",
                    connection_id = %self.connection_id,
                    participant_id = self.participant_id().unwrap_or("-"),
                    message_type,
                    error = %e,
                    "Request failed"
                );
                ServerMessage::Error {
                    category: e.category(),
                    message: e.client_message(),
                }
            }
        }
    }

    fn require_identity(&self) -> Result<String, CoordinatorError> {
        self.identity
            .as_ref()
            .map(|i| i.participant_id.clone())
            .ok_or_else(|| CoordinatorError::Validation("join a room first".to_string()))
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<ServerMessage, CoordinatorError> {
        if let ClientMessage::JoinRoom {
            room_id,
            class_ref,
            participant_id,
            display_name,
            role,
        } = message
        {
            let class_ref = class_ref.unwrap_or_else(|| room_id.clone());
            return self
                .join(
                    room_id,
                    class_ref,
                    JoinRequest {
                        participant_id,
                        display_name,
                        role,
                    },
                )
                .await;
        }

        let participant_id = self.require_identity()?;
        let state = Arc::clone(&self.state);
        let pid = participant_id.as_str();

        let reply = match message {
            ClientMessage::JoinRoom { .. } => {
                return Err(CoordinatorError::Validation("already joined".to_string()))
            }
            ClientMessage::LeaveRoom => {
                self.leave(LeaveReason::Explicit).await?;
                ServerMessage::Ack
            }
            ClientMessage::CreateTransport { direction } => ServerMessage::TransportCreated {
                transport: state.negotiator.request_transport(pid, direction).await?,
            },
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                state
                    .negotiator
                    .connect_transport(pid, &transport_id, dtls_parameters)
                    .await?;
                ServerMessage::TransportConnected { transport_id }
            }
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let producer = state
                    .negotiator
                    .produce(pid, &transport_id, kind, rtp_parameters)
                    .await?;
                ServerMessage::ProducerCreated {
                    producer_id: producer.producer_id,
                    kind: producer.kind,
                }
            }
            ClientMessage::CloseProducer { producer_id } => {
                state.negotiator.close_producer(pid, &producer_id).await?;
                ServerMessage::Ack
            }
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => ServerMessage::ConsumerCreated {
                consumer: state
                    .negotiator
                    .consume(pid, &producer_id, rtp_capabilities)
                    .await?,
            },
            ClientMessage::ResumeConsumer { consumer_id } => {
                state
                    .negotiator
                    .set_consumer_paused(pid, &consumer_id, false)
                    .await?;
                ServerMessage::Ack
            }
            ClientMessage::PauseConsumer { consumer_id } => {
                state
                    .negotiator
                    .set_consumer_paused(pid, &consumer_id, true)
                    .await?;
                ServerMessage::Ack
            }
            ClientMessage::RequestProducerList => {
                state.negotiator.request_producer_list(pid).await?;
                ServerMessage::Ack
            }
            ClientMessage::ApproveParticipant { participant_id } => {
                state.permissions.approve(pid, &participant_id).await?;
                ServerMessage::Ack
            }
            ClientMessage::DenyParticipant { participant_id } => {
                state.permissions.deny(pid, &participant_id).await?;
                ServerMessage::Ack
            }
            ClientMessage::GrantPermission {
                participant_id,
                capability,
            } => {
                state
                    .permissions
                    .grant_permission(pid, &participant_id, capability)
                    .await?;
                ServerMessage::Ack
            }
            ClientMessage::RevokePermission {
                participant_id,
                capability,
            } => {
                state
                    .permissions
                    .revoke_permission(pid, &participant_id, capability)
                    .await?;
                ServerMessage::Ack
            }
            ClientMessage::RequestPermission { capability } => {
                state.permissions.request_permission(pid, capability).await?;
                ServerMessage::Ack
            }
            ClientMessage::UpdateMediaState { audio, video } => {
                state
                    .permissions
                    .update_media_state(pid, audio, video)
                    .await?;
                ServerMessage::Ack
            }
        };
        Ok(reply)
    }

    async fn join(
        &mut self,
        room_id: String,
        class_ref: String,
        request: JoinRequest,
    ) -> Result<ServerMessage, CoordinatorError> {
        if let Some(identity) = &self.identity {
            return Err(CoordinatorError::Validation(format!(
                "connection already speaks for {}",
                identity.participant_id
            )));
        }

        let participant_id = request.participant_id.clone();
        let presence = &self.state.presence;
        if presence.is_connected(&participant_id) {
            return Err(CoordinatorError::Conflict(format!(
                "{participant_id} is already connected"
            )));
        }
        presence.register(&participant_id, &self.connection_id, self.outbound.clone());

        let outcome = match self
            .state
            .registry
            .add_participant(&room_id, &class_ref, request)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                presence.unregister(&participant_id, &self.connection_id);
                return Err(e);
            }
        };

        info!(
            target: "sc.signaling",
            connection_id = %self.connection_id,
            participant_id = %participant_id,
            room_id = %room_id,
            waiting = matches!(outcome, JoinOutcome::Waiting { .. }),
            "Participant bound to connection"
        );
        self.identity = Some(Identity {
            participant_id,
            room_id: room_id.clone(),
        });

        Ok(match outcome {
            JoinOutcome::Joined(snapshot) => snapshot.into_message(),
            JoinOutcome::Waiting { position } => {
                ServerMessage::WaitingForApproval { room_id, position }
            }
        })
    }

    async fn leave(&mut self, reason: LeaveReason) -> Result<(), CoordinatorError> {
        let Some(identity) = self.identity.take() else {
            return Ok(());
        };
        self.state
            .presence
            .unregister(&identity.participant_id, &self.connection_id);
        self.state
            .registry
            .remove_participant(&identity.participant_id, reason)
            .await
            .map(|_| ())
    }

    /// Observe a push before it is written to the socket.
    ///
    /// A denial ends the participant's association with the room, so the
    /// connection may join again afterwards.
    pub fn on_outbound(&mut self, message: &ServerMessage) {
        if let ServerMessage::WaitingRoomDenied { room_id } = message {
            let denied_here = self
                .identity
                .as_ref()
                .is_some_and(|identity| &identity.room_id == room_id);
            if !denied_here {
                return;
            }
            if let Some(identity) = self.identity.take() {
                self.state
                    .presence
                    .unregister(&identity.participant_id, &self.connection_id);
            }
        }
    }

    /// Release the participant when the socket goes away.
    pub async fn on_disconnect(&mut self) {
        let participant_id = self.participant_id().map(str::to_string);
        if let Err(e) = self.leave(LeaveReason::Disconnected).await {
            // Already released (for example, denied or room closed)
            if !matches!(e, CoordinatorError::UnknownParticipant(_)) {
                warn!(
                    target: "sc.signaling",
                    connection_id = %self.connection_id,
                    participant_id = participant_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Failed to release participant on disconnect"
                );
            }
        }
    }
}
