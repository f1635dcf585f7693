//! `RoomActor` - per-room actor that owns all session state for one class.
//!
//! Each `RoomActor`:
//! - Owns the participant map, waiting room and producer table
//! - Serializes every mutation through its mailbox
//! - Fans notifications out through the presence gateway
//! - Republishes the authoritative producer list on a fixed interval
//!
//! The actor never awaits the media engine while handling a message.
//! Callers run engine round-trips outside and commit the results here;
//! only graceful shutdown talks to the engine directly.

use super::messages::{
    ConsumeTicket, JoinOutcome, JoinRequest, JoinSnapshot, LeaveOutcome, LeaveReason,
    MediaInventory, PermissionOutcome, Reply, RoomMessage, RosterEntry, RosterSnapshot,
    TransportReplacement,
};
use super::metrics::{ActorMetrics, MailboxMonitor};
use crate::admission::{AdmissionEvent, AdmissionState, ClassPolicy, WaitingEntry, WaitingRoom, WaitingStatus};
use crate::config::RoomSettings;
use crate::errors::CoordinatorError;
use crate::media_engine::MediaEngine;
use crate::observability::metrics;
use crate::persistence::{spawn_publish, ProjectionStore, RoomProjection, RoomStatus};
use crate::presence::PresenceGateway;
use crate::producers::{announcement, closure_notice, ProducerBroker};
use crate::quality::scalability;

use chrono::{DateTime, Utc};
use common::signaling::{ParticipantPermissions, ParticipantSummary, ServerMessage};
use common::types::{
    Capability, ConnectionState, ConsumerDescriptor, ConsumerRef, ConsumerState, MediaKind,
    PermissionSet, ProducerRef, ProducerState, QualityTier, Role, TransportDirection,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Upper bound on engine cleanup during shutdown.
const SHUTDOWN_ENGINE_TIMEOUT: Duration = Duration::from_secs(5);

/// `reason` carried by `consumerPaused` when the quality adapter sheds a link.
pub const DEGRADED_LINK_REASON: &str = "degraded_link";

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Whether the actor has stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for tasks that must stop with this room.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    fn closed_error(&self) -> CoordinatorError {
        CoordinatorError::RoomClosed(format!("room {} is closed", self.room_id))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RoomMessage,
    ) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, CoordinatorError> {
        self.request(|respond_to| RoomMessage::Join {
            request,
            respond_to,
        })
        .await
    }

    pub async fn leave(
        &self,
        participant_id: &str,
        reason: LeaveReason,
    ) -> Result<LeaveOutcome, CoordinatorError> {
        self.request(|respond_to| RoomMessage::Leave {
            participant_id: participant_id.to_string(),
            reason,
            respond_to,
        })
        .await
    }

    pub async fn approve(
        &self,
        moderator_id: &str,
        participant_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::Approve {
            moderator_id: moderator_id.to_string(),
            participant_id: participant_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn deny(&self, moderator_id: &str, participant_id: &str) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::Deny {
            moderator_id: moderator_id.to_string(),
            participant_id: participant_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn set_permission(
        &self,
        moderator_id: &str,
        participant_id: &str,
        capability: Capability,
        granted: bool,
    ) -> Result<PermissionOutcome, CoordinatorError> {
        self.request(|respond_to| RoomMessage::SetPermission {
            moderator_id: moderator_id.to_string(),
            participant_id: participant_id.to_string(),
            capability,
            granted,
            respond_to,
        })
        .await
    }

    pub async fn request_permission(
        &self,
        participant_id: &str,
        capability: Capability,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::RequestPermission {
            participant_id: participant_id.to_string(),
            capability,
            respond_to,
        })
        .await
    }

    pub async fn update_media_state(
        &self,
        participant_id: &str,
        audio: bool,
        video: bool,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::UpdateMediaState {
            participant_id: participant_id.to_string(),
            audio,
            video,
            respond_to,
        })
        .await
    }

    pub async fn check_member(&self, participant_id: &str) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::CheckMember {
            participant_id: participant_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn record_transport(
        &self,
        participant_id: &str,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportReplacement, CoordinatorError> {
        self.request(|respond_to| RoomMessage::RecordTransport {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            direction,
            respond_to,
        })
        .await
    }

    pub async fn transport_direction(
        &self,
        participant_id: &str,
        transport_id: &str,
    ) -> Result<TransportDirection, CoordinatorError> {
        self.request(|respond_to| RoomMessage::TransportDirection {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn transport_connected(
        &self,
        participant_id: &str,
        transport_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::TransportConnected {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn authorize_produce(
        &self,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::AuthorizeProduce {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            kind,
            respond_to,
        })
        .await
    }

    pub async fn producer_created(
        &self,
        participant_id: &str,
        transport_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<ProducerRef, CoordinatorError> {
        self.request(|respond_to| RoomMessage::ProducerCreated {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
            respond_to,
        })
        .await
    }

    pub async fn close_producer(
        &self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<ProducerRef, CoordinatorError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            participant_id: participant_id.to_string(),
            producer_id: producer_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn authorize_consume(
        &self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<ConsumeTicket, CoordinatorError> {
        self.request(|respond_to| RoomMessage::AuthorizeConsume {
            participant_id: participant_id.to_string(),
            producer_id: producer_id.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn consumer_created(
        &self,
        participant_id: &str,
        transport_id: &str,
        consumer: ConsumerDescriptor,
    ) -> Result<ConsumerRef, CoordinatorError> {
        self.request(|respond_to| RoomMessage::ConsumerCreated {
            participant_id: participant_id.to_string(),
            transport_id: transport_id.to_string(),
            consumer,
            respond_to,
        })
        .await
    }

    pub async fn update_consumer_state(
        &self,
        participant_id: &str,
        consumer_id: &str,
        state: ConsumerState,
    ) -> Result<ConsumerState, CoordinatorError> {
        self.request(|respond_to| RoomMessage::UpdateConsumerState {
            participant_id: participant_id.to_string(),
            consumer_id: consumer_id.to_string(),
            state,
            respond_to,
        })
        .await
    }

    pub async fn publish_producer_list(
        &self,
        recipient: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        self.request(|respond_to| RoomMessage::PublishProducerList {
            recipient: recipient.map(str::to_string),
            respond_to,
        })
        .await
    }

    pub async fn roster_snapshot(&self) -> Result<RosterSnapshot, CoordinatorError> {
        self.query(|respond_to| RoomMessage::RosterSnapshot { respond_to })
            .await
    }

    pub async fn media_inventory(&self) -> Result<MediaInventory, CoordinatorError> {
        self.query(|respond_to| RoomMessage::MediaInventory { respond_to })
            .await
    }

    pub async fn quality_tier_changed(
        &self,
        producer_id: &str,
        tier: QualityTier,
    ) -> Result<(), CoordinatorError> {
        self.sender
            .send(RoomMessage::QualityTierChanged {
                producer_id: producer_id.to_string(),
                tier,
            })
            .await
            .map_err(|_| self.closed_error())
    }

    pub async fn consumer_degraded(
        &self,
        consumer_id: &str,
        degraded: bool,
    ) -> Result<bool, CoordinatorError> {
        self.query(|respond_to| RoomMessage::ConsumerDegraded {
            consumer_id: consumer_id.to_string(),
            degraded,
            respond_to,
        })
        .await
    }

    /// Ask the room to close itself if nobody is joined or waiting.
    pub async fn close_if_empty(&self) -> Result<bool, CoordinatorError> {
        self.query(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }
}

/// Everything a room actor is built from.
pub struct RoomContext {
    pub room_id: String,
    pub class_ref: String,
    pub policy: ClassPolicy,
    pub rtp_capabilities: serde_json::Value,
    pub settings: RoomSettings,
    pub engine: Arc<dyn MediaEngine>,
    pub presence: Arc<PresenceGateway>,
    pub store: Arc<dyn ProjectionStore>,
    pub metrics: Arc<ActorMetrics>,
}

#[derive(Debug)]
struct TransportRecord {
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct ConsumerRecord {
    consumer: ConsumerRef,
    transport_id: String,
    /// Paused by the quality adapter rather than by its owner.
    degraded: bool,
}

/// Participant state within a room.
#[derive(Debug)]
struct Participant {
    participant_id: String,
    display_name: String,
    role: Role,
    admission: AdmissionState,
    connection_state: ConnectionState,
    permissions: PermissionSet,
    audio: bool,
    video: bool,
    transports: HashMap<String, TransportRecord>,
    /// Producer id to the send transport it rides on.
    producer_transports: HashMap<String, String>,
    /// Consumer id to record. At most one per producer.
    consumers: HashMap<String, ConsumerRecord>,
    pending_requests: HashSet<Capability>,
    joined_at: DateTime<Utc>,
}

impl Participant {
    fn consumes(&self, producer_id: &str) -> bool {
        self.consumers
            .values()
            .any(|record| record.consumer.producer_id == producer_id)
    }

    fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            permissions: self.permissions,
            audio: self.audio,
            video: self.video,
        }
    }

    fn transport_for(&self, direction: TransportDirection) -> Option<(&String, &TransportRecord)> {
        self.transports
            .iter()
            .find(|(_, transport)| transport.direction == direction)
    }

    fn set_media_flag(&mut self, kind: MediaKind, on: bool) -> bool {
        let flag = match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        };
        let changed = *flag != on;
        *flag = on;
        changed
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    class_ref: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    policy: ClassPolicy,
    rtp_capabilities: serde_json::Value,
    settings: RoomSettings,
    engine: Arc<dyn MediaEngine>,
    presence: Arc<PresenceGateway>,
    store: Arc<dyn ProjectionStore>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    broker: ProducerBroker,
    waiting: WaitingRoom,
    participants: HashMap<String, Participant>,
    /// Current scalability band; a change is broadcast.
    band: usize,
    closed: bool,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// `cancel_token` should be a child of the registry's token.
    pub fn spawn(
        context: RoomContext,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let room_id = context.room_id;

        let actor = Self {
            room_id: room_id.clone(),
            class_ref: context.class_ref,
            receiver,
            cancel_token: cancel_token.clone(),
            policy: context.policy,
            rtp_capabilities: context.rtp_capabilities,
            broker: ProducerBroker::new(context.settings.recently_closed_ttl),
            settings: context.settings,
            engine: context.engine,
            presence: context.presence,
            store: context.store,
            metrics: context.metrics,
            mailbox: MailboxMonitor::new(&room_id),
            waiting: WaitingRoom::new(),
            participants: HashMap::new(),
            band: 0,
            closed: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sc.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            class_ref = %self.class_ref,
            "RoomActor started"
        );

        let period = self.settings.producer_list_interval;
        let mut republish = tokio::time::interval_at(Instant::now() + period, period);
        republish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = republish.tick() => {
                    self.on_tick();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue(self.receiver.len());
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if self.closed {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sc.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_join(request));
            }
            RoomMessage::Leave {
                participant_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.handle_leave(&participant_id, reason)));
            }
            RoomMessage::Approve {
                moderator_id,
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_approve(&moderator_id, &participant_id));
            }
            RoomMessage::Deny {
                moderator_id,
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_deny(&moderator_id, &participant_id));
            }
            RoomMessage::SetPermission {
                moderator_id,
                participant_id,
                capability,
                granted,
                respond_to,
            } => {
                let result =
                    self.handle_set_permission(&moderator_id, &participant_id, capability, granted);
                let _ = respond_to.send(result);
            }
            RoomMessage::RequestPermission {
                participant_id,
                capability,
                respond_to,
            } => {
                let _ =
                    respond_to.send(self.handle_request_permission(&participant_id, capability));
            }
            RoomMessage::UpdateMediaState {
                participant_id,
                audio,
                video,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_media_state(&participant_id, audio, video));
            }
            RoomMessage::CheckMember {
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.member(&participant_id).map(|_| ()));
            }
            RoomMessage::RecordTransport {
                participant_id,
                transport_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_record_transport(&participant_id, transport_id, direction);
                let _ = respond_to.send(result);
            }
            RoomMessage::TransportDirection {
                participant_id,
                transport_id,
                respond_to,
            } => {
                let result = self
                    .transport(&participant_id, &transport_id)
                    .map(|transport| transport.direction);
                let _ = respond_to.send(result);
            }
            RoomMessage::TransportConnected {
                participant_id,
                transport_id,
                respond_to,
            } => {
                let result = self.handle_transport_connected(&participant_id, &transport_id);
                let _ = respond_to.send(result);
            }
            RoomMessage::AuthorizeProduce {
                participant_id,
                transport_id,
                kind,
                respond_to,
            } => {
                let result = self.authorize_produce(&participant_id, &transport_id, kind);
                let _ = respond_to.send(result);
            }
            RoomMessage::ProducerCreated {
                participant_id,
                transport_id,
                producer_id,
                kind,
                respond_to,
            } => {
                let result =
                    self.handle_producer_created(&participant_id, &transport_id, &producer_id, kind);
                let _ = respond_to.send(result);
            }
            RoomMessage::CloseProducer {
                participant_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_close_producer(&participant_id, &producer_id);
                let _ = respond_to.send(result);
            }
            RoomMessage::AuthorizeConsume {
                participant_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.authorize_consume(&participant_id, &producer_id));
            }
            RoomMessage::ConsumerCreated {
                participant_id,
                transport_id,
                consumer,
                respond_to,
            } => {
                let result = self.handle_consumer_created(&participant_id, transport_id, consumer);
                let _ = respond_to.send(result);
            }
            RoomMessage::UpdateConsumerState {
                participant_id,
                consumer_id,
                state,
                respond_to,
            } => {
                let result = self.handle_consumer_state(&participant_id, &consumer_id, state);
                let _ = respond_to.send(result);
            }
            RoomMessage::PublishProducerList {
                recipient,
                respond_to,
            } => {
                let result = match recipient.as_deref() {
                    Some(participant_id) => self.member(participant_id).map(|_| {
                        self.publish_producer_list(Some(participant_id));
                    }),
                    None => {
                        self.publish_producer_list(None);
                        Ok(())
                    }
                };
                let _ = respond_to.send(result);
            }
            RoomMessage::RosterSnapshot { respond_to } => {
                let _ = respond_to.send(self.roster_snapshot());
            }
            RoomMessage::MediaInventory { respond_to } => {
                let _ = respond_to.send(self.media_inventory());
            }
            RoomMessage::QualityTierChanged { producer_id, tier } => {
                self.handle_tier_changed(&producer_id, tier);
            }
            RoomMessage::ConsumerDegraded {
                consumer_id,
                degraded,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_consumer_degraded(&consumer_id, degraded));
            }
            RoomMessage::CloseIfEmpty { respond_to } => {
                let _ = respond_to.send(self.handle_close_if_empty());
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn capacity(&self) -> usize {
        self.policy
            .max_participants
            .unwrap_or(self.settings.max_participants)
    }

    fn handle_join(&mut self, request: JoinRequest) -> Result<JoinOutcome, CoordinatorError> {
        let participant_id = request.participant_id.clone();

        if self.participants.contains_key(&participant_id) {
            return Err(CoordinatorError::Conflict(format!(
                "{participant_id} already joined room {}",
                self.room_id
            )));
        }
        if let Some(position) = self.waiting.position(&participant_id) {
            return Ok(JoinOutcome::Waiting { position });
        }
        if self.participants.len() >= self.capacity() {
            metrics::record_admission("rejected");
            return Err(CoordinatorError::CapacityExceeded(format!(
                "room {} is full ({} participants)",
                self.room_id,
                self.capacity()
            )));
        }
        if let Err(e) = self.policy.check_schedule(request.role, Utc::now()) {
            metrics::record_admission("rejected");
            return Err(e);
        }

        let state = AdmissionState::Requesting.apply(self.policy.gate(request.role))?;
        if state == AdmissionState::WaitingForApproval {
            let position = self.waiting.enqueue(WaitingEntry::new(
                &participant_id,
                &request.display_name,
                request.role,
            ));
            metrics::record_admission("waiting");
            info!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                position,
                "Participant waiting for approval"
            );
            self.notify_waiting_room_changed();
            self.publish_projection();
            return Ok(JoinOutcome::Waiting { position });
        }

        let snapshot = self.admit(request, state)?;
        metrics::record_admission("admitted");
        Ok(JoinOutcome::Joined(Box::new(snapshot)))
    }

    /// Move an `Admitted` request into the room.
    fn admit(
        &mut self,
        request: JoinRequest,
        admitted: AdmissionState,
    ) -> Result<JoinSnapshot, CoordinatorError> {
        let admission = admitted.apply(AdmissionEvent::Join)?;
        let participant = Participant {
            participant_id: request.participant_id.clone(),
            display_name: request.display_name,
            role: request.role,
            admission,
            connection_state: ConnectionState::Joined,
            permissions: self.policy.initial_permissions(request.role),
            audio: false,
            video: false,
            transports: HashMap::new(),
            producer_transports: HashMap::new(),
            consumers: HashMap::new(),
            pending_requests: HashSet::new(),
            joined_at: Utc::now(),
        };
        let participant_id = request.participant_id;
        let summary = participant.summary();
        self.participants
            .insert(participant_id.clone(), participant);
        self.metrics.participant_joined();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            role = %request.role,
            participants = self.participants.len(),
            "Participant joined"
        );

        self.broadcast_except(
            &participant_id,
            &ServerMessage::ParticipantJoined {
                participant: summary,
            },
        );
        if request.role.is_moderator() {
            self.send_to(
                &participant_id,
                ServerMessage::WaitingRoomUpdate {
                    entries: self.waiting.summaries(),
                },
            );
        }
        self.check_scalability();
        self.publish_projection();

        Ok(self.join_snapshot(&participant_id))
    }

    fn join_snapshot(&self, participant_id: &str) -> JoinSnapshot {
        JoinSnapshot {
            room_id: self.room_id.clone(),
            participant_id: participant_id.to_string(),
            rtp_capabilities: self.rtp_capabilities.clone(),
            existing_producers: self.broker.visible_to(participant_id),
            revision: self.broker.revision(),
            permissions: self
                .participants
                .get(participant_id)
                .map(|p| p.permissions)
                .unwrap_or_default(),
            participants: self.participant_summaries(),
            policy: scalability::policy_for(self.participants.len()),
        }
    }

    fn handle_approve(
        &mut self,
        moderator_id: &str,
        participant_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.require_moderator(moderator_id, "approve")?;
        if !self.waiting.contains(participant_id) {
            return Err(CoordinatorError::Validation(format!(
                "{participant_id} is not waiting"
            )));
        }
        if self.participants.len() >= self.capacity() {
            return Err(CoordinatorError::CapacityExceeded(format!(
                "room {} is full ({} participants)",
                self.room_id,
                self.capacity()
            )));
        }

        let entry = self
            .waiting
            .resolve(participant_id, WaitingStatus::Approved)?;
        let admitted = AdmissionState::WaitingForApproval.apply(AdmissionEvent::Approve)?;

        self.send_to(
            participant_id,
            ServerMessage::WaitingRoomApproved {
                room_id: self.room_id.clone(),
            },
        );
        let snapshot = self.admit(
            JoinRequest {
                participant_id: entry.participant_id,
                display_name: entry.display_name,
                role: entry.role,
            },
            admitted,
        )?;
        self.send_to(participant_id, snapshot.into_message());
        self.notify_waiting_room_changed();
        metrics::record_admission("admitted");

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            moderator_id = %moderator_id,
            "Participant approved"
        );
        Ok(())
    }

    fn handle_deny(&mut self, moderator_id: &str, participant_id: &str) -> Result<(), CoordinatorError> {
        self.require_moderator(moderator_id, "deny")?;
        let entry = self.waiting.resolve(participant_id, WaitingStatus::Denied)?;
        AdmissionState::WaitingForApproval.apply(AdmissionEvent::Deny)?;

        self.send_to(
            &entry.participant_id,
            ServerMessage::WaitingRoomDenied {
                room_id: self.room_id.clone(),
            },
        );
        self.notify_waiting_room_changed();
        self.publish_projection();
        metrics::record_admission("denied");

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            moderator_id = %moderator_id,
            "Participant denied"
        );
        Ok(())
    }

    fn handle_leave(&mut self, participant_id: &str, reason: LeaveReason) -> LeaveOutcome {
        if self.waiting.cancel(participant_id).is_some() {
            info!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                reason = reason.as_str(),
                "Waiting participant left"
            );
            self.notify_waiting_room_changed();
            self.publish_projection();
            return LeaveOutcome::CancelledWaiting;
        }

        let owned = self.broker.owned_by(participant_id);
        let Some(mut participant) = self.participants.remove(participant_id) else {
            return LeaveOutcome::NotPresent;
        };
        if let Ok(next) = participant.admission.apply(AdmissionEvent::Leave) {
            participant.admission = next;
        }
        participant.connection_state = ConnectionState::Disconnected;
        self.metrics.participant_left();

        let producers: Vec<ProducerRef> = owned
            .iter()
            .filter_map(|producer| self.close_producer_internal(&producer.producer_id, reason.as_str()))
            .collect();
        let transports: Vec<String> = participant.transports.into_keys().collect();

        for capability in participant.pending_requests {
            self.notify_moderators(&ServerMessage::PermissionRequestCancelled {
                participant_id: participant_id.to_string(),
                capability,
            });
        }
        self.broadcast(&ServerMessage::ParticipantLeft {
            participant_id: participant_id.to_string(),
        });
        if !producers.is_empty() {
            self.publish_producer_list(None);
        }
        self.check_scalability();
        self.publish_projection();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            reason = reason.as_str(),
            producers_closed = producers.len(),
            joined_for_secs = (Utc::now() - participant.joined_at).num_seconds(),
            "Participant left"
        );

        LeaveOutcome::Left {
            producers,
            transports,
        }
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    fn require_moderator(&self, actor_id: &str, action: &'static str) -> Result<(), CoordinatorError> {
        let role = self.participants.get(actor_id).map(|p| p.role);
        match role {
            Some(role) if role.is_moderator() => Ok(()),
            _ => {
                warn!(
                    target: "sc.audit",
                    room_id = %self.room_id,
                    actor_id = %actor_id,
                    role = role.map_or("none", |r| r.as_str()),
                    action,
                    "Moderator action denied"
                );
                Err(CoordinatorError::PermissionDenied(format!(
                    "{action} requires a moderator role"
                )))
            }
        }
    }

    fn handle_set_permission(
        &mut self,
        moderator_id: &str,
        participant_id: &str,
        capability: Capability,
        granted: bool,
    ) -> Result<PermissionOutcome, CoordinatorError> {
        let action = if granted { "grant" } else { "revoke" };
        self.require_moderator(moderator_id, action)?;

        let target_role = self.member(participant_id)?.role;
        if !granted && target_role.is_moderator() && participant_id != moderator_id {
            warn!(
                target: "sc.audit",
                room_id = %self.room_id,
                actor_id = %moderator_id,
                target_id = %participant_id,
                action,
                "Revoke against another moderator denied"
            );
            return Err(CoordinatorError::PermissionDenied(
                "cannot revoke capabilities of another moderator".to_string(),
            ));
        }

        let changed = {
            let target = self.member_mut(participant_id)?;
            if granted {
                target.pending_requests.remove(&capability);
            }
            target.permissions.set(capability, granted)
        };
        if !changed {
            return Ok(PermissionOutcome::Unchanged);
        }

        let mut closed_producers = Vec::new();
        if granted {
            self.send_to(
                participant_id,
                ServerMessage::PermissionGranted {
                    participant_id: participant_id.to_string(),
                    capability,
                },
            );
        } else {
            let kind = capability.kind();
            if let Some(producer_id) = self
                .broker
                .producer_of(participant_id, kind)
                .map(|p| p.producer_id.clone())
            {
                closed_producers.extend(self.close_producer_internal(&producer_id, "revoked"));
            }
            let media_changed = self
                .participants
                .get_mut(participant_id)
                .is_some_and(|p| p.set_media_flag(kind, false));

            self.send_to(
                participant_id,
                ServerMessage::PermissionRevoked {
                    participant_id: participant_id.to_string(),
                    capability,
                },
            );
            if !closed_producers.is_empty() {
                self.publish_producer_list(None);
            }
            if media_changed {
                self.broadcast_media_state(participant_id);
            }
        }

        self.send_to(moderator_id, self.permissions_sync());

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            moderator_id = %moderator_id,
            capability = capability.as_str(),
            action,
            producers_closed = closed_producers.len(),
            "Permission changed"
        );
        Ok(PermissionOutcome::Applied { closed_producers })
    }

    fn handle_request_permission(
        &mut self,
        participant_id: &str,
        capability: Capability,
    ) -> Result<(), CoordinatorError> {
        let newly_requested = {
            let participant = self.member_mut(participant_id)?;
            !participant.permissions.allows(capability)
                && participant.pending_requests.insert(capability)
        };
        if newly_requested {
            self.notify_moderators(&ServerMessage::PermissionRequested {
                participant_id: participant_id.to_string(),
                capability,
            });
        }
        Ok(())
    }

    fn handle_media_state(
        &mut self,
        participant_id: &str,
        audio: bool,
        video: bool,
    ) -> Result<(), CoordinatorError> {
        let permissions = self.member(participant_id)?.permissions;
        for (on, capability) in [(audio, Capability::Mic), (video, Capability::Camera)] {
            if on && !permissions.allows(capability) {
                return Err(CoordinatorError::PermissionDenied(format!(
                    "{capability} permission not granted"
                )));
            }
        }

        if let Some(participant) = self.participants.get_mut(participant_id) {
            participant.audio = audio;
            participant.video = video;
        }
        for (on, kind) in [(audio, MediaKind::Audio), (video, MediaKind::Video)] {
            if let Some(producer_id) = self
                .broker
                .producer_of(participant_id, kind)
                .map(|p| p.producer_id.clone())
            {
                let state = if on {
                    ProducerState::Active
                } else {
                    ProducerState::Paused
                };
                self.broker.set_state(&producer_id, state);
            }
        }
        self.broadcast_media_state(participant_id);
        Ok(())
    }

    fn permissions_sync(&self) -> ServerMessage {
        let mut participants: Vec<ParticipantPermissions> = self
            .participants
            .values()
            .map(|p| ParticipantPermissions {
                participant_id: p.participant_id.clone(),
                permissions: p.permissions,
            })
            .collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        ServerMessage::PermissionsSync { participants }
    }

    // ------------------------------------------------------------------
    // Transports, producers and consumers
    // ------------------------------------------------------------------

    fn member(&self, participant_id: &str) -> Result<&Participant, CoordinatorError> {
        self.participants.get(participant_id).ok_or_else(|| {
            CoordinatorError::UnknownParticipant(format!(
                "{participant_id} is not in room {}",
                self.room_id
            ))
        })
    }

    fn member_mut(&mut self, participant_id: &str) -> Result<&mut Participant, CoordinatorError> {
        let room_id = &self.room_id;
        self.participants.get_mut(participant_id).ok_or_else(|| {
            CoordinatorError::UnknownParticipant(format!("{participant_id} is not in room {room_id}"))
        })
    }

    fn transport(
        &self,
        participant_id: &str,
        transport_id: &str,
    ) -> Result<&TransportRecord, CoordinatorError> {
        self.member(participant_id)?
            .transports
            .get(transport_id)
            .ok_or_else(|| CoordinatorError::UnknownTransport(format!("unknown transport {transport_id}")))
    }

    fn handle_record_transport(
        &mut self,
        participant_id: &str,
        transport_id: String,
        direction: TransportDirection,
    ) -> Result<TransportReplacement, CoordinatorError> {
        let (replaced, stale_producers) = {
            let participant = self.member_mut(participant_id)?;
            let replaced = participant
                .transport_for(direction)
                .map(|(id, _)| id.clone());
            let mut stale_producers = Vec::new();
            if let Some(old) = &replaced {
                participant.transports.remove(old);
                match direction {
                    TransportDirection::Send => {
                        stale_producers = participant
                            .producer_transports
                            .iter()
                            .filter(|(_, transport)| *transport == old)
                            .map(|(producer, _)| producer.clone())
                            .collect();
                    }
                    TransportDirection::Recv => {
                        participant
                            .consumers
                            .retain(|_, record| &record.transport_id != old);
                    }
                }
            }
            participant.transports.insert(
                transport_id.clone(),
                TransportRecord {
                    direction,
                    connected: false,
                },
            );
            (replaced, stale_producers)
        };

        let closed_producers: Vec<ProducerRef> = stale_producers
            .iter()
            .filter_map(|producer_id| self.close_producer_internal(producer_id, "transport_replaced"))
            .collect();
        if !closed_producers.is_empty() {
            self.publish_producer_list(None);
        }

        debug!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            replaced = replaced.is_some(),
            "Transport recorded"
        );
        Ok(TransportReplacement {
            replaced,
            closed_producers,
        })
    }

    fn handle_transport_connected(
        &mut self,
        participant_id: &str,
        transport_id: &str,
    ) -> Result<(), CoordinatorError> {
        let participant = self.member_mut(participant_id)?;
        let transport = participant
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| CoordinatorError::UnknownTransport(format!("unknown transport {transport_id}")))?;
        transport.connected = true;
        participant.connection_state = ConnectionState::Connected;
        Ok(())
    }

    fn authorize_produce(
        &self,
        participant_id: &str,
        transport_id: &str,
        kind: MediaKind,
    ) -> Result<(), CoordinatorError> {
        let participant = self.member(participant_id)?;
        let transport = self.transport(participant_id, transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(CoordinatorError::Validation(format!(
                "transport {transport_id} is not a send transport"
            )));
        }
        let capability = Capability::for_kind(kind);
        if !participant.permissions.allows(capability) {
            return Err(CoordinatorError::PermissionDenied(format!(
                "{capability} permission not granted"
            )));
        }
        if self.broker.producer_of(participant_id, kind).is_some() {
            return Err(CoordinatorError::Validation(format!(
                "already producing {kind}; close the existing producer first"
            )));
        }
        Ok(())
    }

    fn handle_producer_created(
        &mut self,
        participant_id: &str,
        transport_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<ProducerRef, CoordinatorError> {
        // Re-check: permission may have been revoked during the engine call
        let participant = self.member(participant_id)?;
        if !participant.transports.contains_key(transport_id) {
            return Err(CoordinatorError::UnknownTransport(format!(
                "unknown transport {transport_id}"
            )));
        }
        let capability = Capability::for_kind(kind);
        if !participant.permissions.allows(capability) {
            return Err(CoordinatorError::PermissionDenied(format!(
                "{capability} permission revoked"
            )));
        }

        let producer = self
            .broker
            .on_producer_created(participant_id, producer_id, kind)?;
        let media_changed = match self.participants.get_mut(participant_id) {
            Some(participant) => {
                participant
                    .producer_transports
                    .insert(producer_id.to_string(), transport_id.to_string());
                participant.set_media_flag(kind, true)
            }
            None => false,
        };

        self.broadcast_except(participant_id, &announcement(&producer));
        self.publish_producer_list(None);
        if media_changed {
            self.broadcast_media_state(participant_id);
        }

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            revision = self.broker.revision(),
            "Producer created"
        );
        Ok(producer)
    }

    fn handle_close_producer(
        &mut self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<ProducerRef, CoordinatorError> {
        self.member(participant_id)?;
        let producer = self.broker.get(producer_id).ok_or_else(|| {
            CoordinatorError::Validation(format!("unknown producer {producer_id}"))
        })?;
        if producer.owner_id != participant_id {
            return Err(CoordinatorError::PermissionDenied(
                "only the owner may close a producer".to_string(),
            ));
        }
        let kind = producer.kind;

        let closed = self
            .close_producer_internal(producer_id, "closed_by_owner")
            .ok_or_else(|| CoordinatorError::Validation(format!("unknown producer {producer_id}")))?;
        let media_changed = self
            .participants
            .get_mut(participant_id)
            .is_some_and(|p| p.set_media_flag(kind, false));

        self.publish_producer_list(None);
        if media_changed {
            self.broadcast_media_state(participant_id);
        }
        Ok(closed)
    }

    /// Remove a producer, drop every consumer of it and fan out the closure.
    fn close_producer_internal(&mut self, producer_id: &str, reason: &'static str) -> Option<ProducerRef> {
        let closed = self
            .broker
            .on_producer_closed(producer_id, Instant::now())?;
        metrics::record_producer_closed(reason);

        for participant in self.participants.values_mut() {
            participant.producer_transports.remove(producer_id);
            participant
                .consumers
                .retain(|_, record| record.consumer.producer_id != producer_id);
        }
        self.broadcast(&closure_notice(&closed));

        debug!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            producer_id = %producer_id,
            owner_id = %closed.owner_id,
            reason,
            "Producer closed"
        );
        Some(closed)
    }

    fn authorize_consume(
        &self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<ConsumeTicket, CoordinatorError> {
        let participant = self.member(participant_id)?;
        let transport_id = participant
            .transports
            .iter()
            .find(|(_, t)| t.direction == TransportDirection::Recv && t.connected)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| {
                CoordinatorError::Validation("no connected receive transport".to_string())
            })?;

        let Some(producer) = self.broker.get(producer_id) else {
            debug!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                producer_id = %producer_id,
                recently_closed = self.broker.is_recently_closed(producer_id),
                "Consume of unknown producer"
            );
            return Err(CoordinatorError::TransientMedia(format!(
                "producer {producer_id} not found"
            )));
        };
        if producer.owner_id == participant_id {
            return Err(CoordinatorError::Validation(
                "cannot consume your own producer".to_string(),
            ));
        }
        if participant.consumes(producer_id) {
            return Err(CoordinatorError::Validation(format!(
                "already consuming producer {producer_id}"
            )));
        }

        Ok(ConsumeTicket {
            transport_id,
            kind: producer.kind,
            owner_id: producer.owner_id.clone(),
        })
    }

    fn handle_consumer_created(
        &mut self,
        participant_id: &str,
        transport_id: String,
        descriptor: ConsumerDescriptor,
    ) -> Result<ConsumerRef, CoordinatorError> {
        if self.broker.get(&descriptor.producer_id).is_none() {
            return Err(CoordinatorError::TransientMedia(format!(
                "producer {} not found",
                descriptor.producer_id
            )));
        }
        let participant = self.member_mut(participant_id)?;
        // A concurrent consume of the same producer may have committed first
        if participant.consumes(&descriptor.producer_id) {
            return Err(CoordinatorError::Validation(format!(
                "already consuming producer {}",
                descriptor.producer_id
            )));
        }
        let consumer = ConsumerRef {
            consumer_id: descriptor.consumer_id,
            producer_id: descriptor.producer_id,
            kind: descriptor.kind,
            // Engine consumers start paused
            state: ConsumerState::Paused,
        };
        participant.consumers.insert(
            consumer.consumer_id.clone(),
            ConsumerRecord {
                consumer: consumer.clone(),
                transport_id,
                degraded: false,
            },
        );
        Ok(consumer)
    }

    fn handle_consumer_state(
        &mut self,
        participant_id: &str,
        consumer_id: &str,
        state: ConsumerState,
    ) -> Result<ConsumerState, CoordinatorError> {
        if state == ConsumerState::Closed {
            return Err(CoordinatorError::Validation(
                "consumers are closed with their producer".to_string(),
            ));
        }
        let participant = self.member_mut(participant_id)?;
        let record = participant.consumers.get_mut(consumer_id).ok_or_else(|| {
            CoordinatorError::Validation(format!("unknown consumer {consumer_id}"))
        })?;
        let previous = record.consumer.state;
        record.consumer.state = state;
        record.degraded = false;
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // Quality adapter hooks
    // ------------------------------------------------------------------

    fn media_inventory(&self) -> MediaInventory {
        let mut consumers: Vec<ConsumerRef> = self
            .participants
            .values()
            .flat_map(|p| p.consumers.values().map(|record| record.consumer.clone()))
            .collect();
        consumers.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
        MediaInventory {
            producers: self.broker.snapshot().producers,
            consumers,
        }
    }

    fn handle_tier_changed(&self, producer_id: &str, tier: QualityTier) {
        if let Some(producer) = self.broker.get(producer_id) {
            self.send_to(
                &producer.owner_id,
                ServerMessage::QualityTierChanged {
                    producer_id: producer_id.to_string(),
                    tier,
                },
            );
        }
    }

    fn handle_consumer_degraded(&mut self, consumer_id: &str, degraded: bool) -> bool {
        let presence = &self.presence;
        for participant in self.participants.values_mut() {
            let Some(record) = participant.consumers.get_mut(consumer_id) else {
                continue;
            };
            if degraded && record.consumer.state == ConsumerState::Active {
                record.consumer.state = ConsumerState::Paused;
                record.degraded = true;
                presence.send(
                    &participant.participant_id,
                    ServerMessage::ConsumerPaused {
                        consumer_id: consumer_id.to_string(),
                        reason: DEGRADED_LINK_REASON.to_string(),
                    },
                );
                return true;
            }
            if !degraded && record.degraded && record.consumer.state == ConsumerState::Paused {
                record.consumer.state = ConsumerState::Active;
                record.degraded = false;
                presence.send(
                    &participant.participant_id,
                    ServerMessage::ConsumerResumed {
                        consumer_id: consumer_id.to_string(),
                    },
                );
                return true;
            }
            return false;
        }
        false
    }

    // ------------------------------------------------------------------
    // Snapshots and fan-out
    // ------------------------------------------------------------------

    fn participant_summaries(&self) -> Vec<ParticipantSummary> {
        let mut summaries: Vec<ParticipantSummary> =
            self.participants.values().map(Participant::summary).collect();
        summaries.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        summaries
    }

    fn roster_snapshot(&self) -> RosterSnapshot {
        let mut participants: Vec<RosterEntry> = self
            .participants
            .values()
            .map(|p| {
                let mut consumers: Vec<ConsumerRef> =
                    p.consumers.values().map(|r| r.consumer.clone()).collect();
                consumers.sort_by(|a, b| a.consumer_id.cmp(&b.consumer_id));
                RosterEntry {
                    participant_id: p.participant_id.clone(),
                    display_name: p.display_name.clone(),
                    role: p.role,
                    connection_state: p.connection_state,
                    permissions: p.permissions,
                    audio: p.audio,
                    video: p.video,
                    producers: self.broker.owned_by(&p.participant_id),
                    consumers,
                }
            })
            .collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        RosterSnapshot {
            room_id: self.room_id.clone(),
            class_ref: self.class_ref.clone(),
            participants,
            waiting: self.waiting.summaries(),
            producers: self.broker.snapshot(),
            policy: scalability::policy_for(self.participants.len()),
        }
    }

    fn send_to(&self, participant_id: &str, message: ServerMessage) {
        self.presence.send(participant_id, message);
    }

    fn broadcast(&self, message: &ServerMessage) {
        self.presence
            .send_to_all(self.participants.keys().map(String::as_str), message);
    }

    fn broadcast_except(&self, excluded: &str, message: &ServerMessage) {
        self.presence.send_to_all(
            self.participants
                .keys()
                .map(String::as_str)
                .filter(|id| *id != excluded),
            message,
        );
    }

    fn notify_moderators(&self, message: &ServerMessage) {
        self.presence.send_to_all(
            self.participants
                .values()
                .filter(|p| p.role.is_moderator())
                .map(|p| p.participant_id.as_str()),
            message,
        );
    }

    fn notify_waiting_room_changed(&self) {
        self.notify_moderators(&ServerMessage::WaitingRoomUpdate {
            entries: self.waiting.summaries(),
        });
    }

    fn broadcast_media_state(&self, participant_id: &str) {
        if let Some(participant) = self.participants.get(participant_id) {
            self.broadcast(&ServerMessage::MediaStateChanged {
                participant_id: participant_id.to_string(),
                audio: participant.audio,
                video: participant.video,
            });
        }
    }

    fn publish_producer_list(&self, recipient: Option<&str>) {
        let message = self.broker.snapshot().into_message();
        match recipient {
            Some(participant_id) => self.send_to(participant_id, message),
            None => self.broadcast(&message),
        }
    }

    fn check_scalability(&mut self) {
        let roster = self.participants.len();
        let band = scalability::band_for(roster);
        if band == self.band {
            return;
        }
        self.band = band;
        let policy = scalability::policy_for(roster);
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            roster,
            max_video_streams = policy.max_video_streams,
            audio_only_recommended = policy.audio_only_recommended,
            "Scalability policy changed"
        );
        self.broadcast(&ServerMessage::ScalabilityPolicyChanged { policy });
    }

    fn publish_projection(&self) {
        let status = if !self.participants.is_empty() {
            RoomStatus::Live
        } else if !self.waiting.is_empty() {
            RoomStatus::Waiting
        } else {
            RoomStatus::Closed
        };
        spawn_publish(
            Arc::clone(&self.store),
            RoomProjection::new(&self.class_ref, &self.room_id, status, self.participants.len()),
        );
    }

    fn on_tick(&mut self) {
        let pruned = self.broker.prune_markers(Instant::now());
        if pruned > 0 {
            debug!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                pruned,
                "Pruned recently-closed markers"
            );
        }
        if !self.participants.is_empty() {
            self.publish_producer_list(None);
        }
    }

    fn handle_close_if_empty(&mut self) -> bool {
        if !self.participants.is_empty() || !self.waiting.is_empty() {
            return false;
        }
        self.closed = true;
        self.receiver.close();
        // Stops the quality adapter
        self.cancel_token.cancel();
        self.publish_projection();
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            "Room empty, closing"
        );
        true
    }

    /// Close every engine object this room still owns.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            producers = self.broker.len(),
            "Performing graceful shutdown"
        );
        self.closed = true;
        self.receiver.close();

        let producers: Vec<String> = self
            .broker
            .snapshot()
            .producers
            .into_iter()
            .map(|p| p.producer_id)
            .collect();
        let transports: Vec<String> = self
            .participants
            .values()
            .flat_map(|p| p.transports.keys().cloned())
            .collect();

        let engine = Arc::clone(&self.engine);
        let cleanup = async {
            let closing_producers = producers.iter().map(|id| engine.close_producer(id));
            for result in futures::future::join_all(closing_producers).await {
                if let Err(e) = result {
                    warn!(target: "sc.actor.room", error = %e, "Failed to close producer during shutdown");
                }
            }
            let closing_transports = transports.iter().map(|id| engine.close_transport(id));
            for result in futures::future::join_all(closing_transports).await {
                if let Err(e) = result {
                    warn!(target: "sc.actor.room", error = %e, "Failed to close transport during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_ENGINE_TIMEOUT, cleanup)
            .await
            .is_err()
        {
            warn!(
                target: "sc.actor.room",
                room_id = %self.room_id,
                "Engine cleanup timed out during shutdown"
            );
        }

        for producer_id in &producers {
            if self
                .broker
                .on_producer_closed(producer_id, Instant::now())
                .is_some()
            {
                metrics::record_producer_closed("room_closed");
            }
        }
        for _ in self.participants.drain() {
            self.metrics.participant_left();
        }
        self.waiting.drain();
        self.publish_projection();

        info!(
            target: "sc.actor.room",
            room_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }
}
