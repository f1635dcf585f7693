//! Room registry.
//!
//! Owns the `room id → RoomActorHandle` map and the `participant id → room id`
//! membership map. Both sit behind `std::sync::RwLock`s that are never held
//! across an await; all room state itself lives inside the room actors.
//!
//! # Responsibilities
//!
//! - Create rooms on first join (class policy + router capabilities)
//! - Enforce one room per participant and the coordinator room cap
//! - Reclaim rooms once nobody is joined or waiting
//! - Detect finished or panicked room tasks and evict them
//! - Drain every room on shutdown

use crate::actors::{
    ActorMetrics, ActorType, JoinOutcome, JoinRequest, LeaveOutcome, LeaveReason, RoomActor,
    RoomActorHandle, RoomContext, RosterSnapshot,
};
use crate::admission::ClassPolicy;
use crate::config::RoomSettings;
use crate::errors::CoordinatorError;
use crate::media_engine::MediaEngine;
use crate::persistence::ProjectionStore;
use crate::presence::PresenceGateway;
use crate::quality::{QualityAdapter, QualitySettings};
use common::types::ProducerRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How often the supervisor checks room tasks.
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);

/// Registry-wide settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_rooms: usize,
    pub room: RoomSettings,
    pub quality: QualitySettings,
}

/// Coordinator-wide counters reported by [`RoomRegistry::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub participant_count: usize,
    pub accepting: bool,
}

/// Managed room state.
struct ManagedRoom {
    handle: RoomActorHandle,
    /// Distinguishes a room from a later room with the same id.
    generation: u64,
    task_handle: JoinHandle<()>,
    quality_task: JoinHandle<()>,
}

/// Registry of live rooms on this coordinator.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, ManagedRoom>>,
    memberships: RwLock<HashMap<String, String>>,
    engine: Arc<dyn MediaEngine>,
    store: Arc<dyn ProjectionStore>,
    presence: Arc<PresenceGateway>,
    settings: RegistrySettings,
    metrics: Arc<ActorMetrics>,
    cancel_token: CancellationToken,
    accepting: AtomicBool,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    /// Create a registry. Rooms get child tokens of `cancel_token`.
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        store: Arc<dyn ProjectionStore>,
        presence: Arc<PresenceGateway>,
        settings: RegistrySettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            engine,
            store,
            presence,
            settings,
            metrics: ActorMetrics::new(),
            cancel_token,
            accepting: AtomicBool::new(true),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    pub fn presence(&self) -> &Arc<PresenceGateway> {
        &self.presence
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn room_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.room_count(),
            participant_count: self.metrics.participant_count(),
            accepting: self.is_accepting(),
        }
    }

    fn live_handle(&self, room_id: &str) -> Option<(RoomActorHandle, u64)> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .filter(|managed| !managed.handle.is_closed())
            .map(|managed| (managed.handle.clone(), managed.generation))
    }

    /// Handle for a live room, creating the room if needed.
    ///
    /// # Errors
    ///
    /// - `Draining` once shutdown has begun
    /// - `CapacityExceeded` at the coordinator room cap
    /// - `PersistenceUnavailable` if the class record cannot be read
    /// - `Transport` if the media engine cannot provide a router
    #[instrument(skip_all, fields(room_id = %room_id, class_ref = %class_ref))]
    pub async fn get_or_create(
        &self,
        room_id: &str,
        class_ref: &str,
    ) -> Result<RoomActorHandle, CoordinatorError> {
        if let Some((handle, _)) = self.live_handle(room_id) {
            return Ok(handle);
        }
        self.check_can_create()?;

        let policy = match self.store.load_class_policy(class_ref).await {
            Ok(Some(policy)) => policy,
            Ok(None) => ClassPolicy::with_defaults(self.settings.room.approval_required_default),
            Err(e) => {
                warn!(
                    target: "sc.registry",
                    room_id = %room_id,
                    class_ref = %class_ref,
                    error = %e,
                    "Class policy lookup failed"
                );
                return Err(CoordinatorError::PersistenceUnavailable(e.to_string()));
            }
        };

        let rtp_capabilities = self
            .engine
            .router_rtp_capabilities(room_id)
            .await
            .map_err(|e| CoordinatorError::Transport(format!("router unavailable: {e}")))?;

        self.install_room(room_id, class_ref, policy, rtp_capabilities)
    }

    fn check_can_create(&self) -> Result<(), CoordinatorError> {
        if !self.is_accepting() {
            return Err(CoordinatorError::Draining);
        }
        if self.room_count() >= self.settings.max_rooms {
            return Err(CoordinatorError::CapacityExceeded(format!(
                "coordinator is at its limit of {} rooms",
                self.settings.max_rooms
            )));
        }
        Ok(())
    }

    /// Spawn and register a room, unless another caller won the race.
    fn install_room(
        &self,
        room_id: &str,
        class_ref: &str,
        policy: ClassPolicy,
        rtp_capabilities: serde_json::Value,
    ) -> Result<RoomActorHandle, CoordinatorError> {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = rooms.get(room_id) {
            if !existing.handle.is_closed() {
                return Ok(existing.handle.clone());
            }
        }
        if rooms.remove(room_id).is_some() {
            self.metrics.room_removed();
        }
        if !self.is_accepting() {
            return Err(CoordinatorError::Draining);
        }
        if rooms.len() >= self.settings.max_rooms {
            return Err(CoordinatorError::CapacityExceeded(format!(
                "coordinator is at its limit of {} rooms",
                self.settings.max_rooms
            )));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (handle, task_handle) = RoomActor::spawn(
            RoomContext {
                room_id: room_id.to_string(),
                class_ref: class_ref.to_string(),
                policy,
                rtp_capabilities,
                settings: self.settings.room.clone(),
                engine: Arc::clone(&self.engine),
                presence: Arc::clone(&self.presence),
                store: Arc::clone(&self.store),
                metrics: Arc::clone(&self.metrics),
            },
            self.cancel_token.child_token(),
        );
        let quality_task = self.spawn_quality(&handle);

        rooms.insert(
            room_id.to_string(),
            ManagedRoom {
                handle: handle.clone(),
                generation,
                task_handle,
                quality_task,
            },
        );
        self.metrics.room_created();

        info!(
            target: "sc.registry",
            room_id = %room_id,
            class_ref = %class_ref,
            generation,
            room_count = rooms.len(),
            "Room created"
        );
        Ok(handle)
    }

    fn spawn_quality(&self, handle: &RoomActorHandle) -> JoinHandle<()> {
        QualityAdapter::spawn(
            handle.clone(),
            Arc::clone(&self.engine),
            self.settings.quality.clone(),
            handle.child_token(),
        )
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Room the participant currently belongs to (joined or waiting).
    pub fn membership(&self, participant_id: &str) -> Option<String> {
        self.memberships
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(participant_id)
            .cloned()
    }

    /// Record `participant_id → room_id`. Returns whether it was newly added.
    fn claim_membership(&self, participant_id: &str, room_id: &str) -> Result<bool, CoordinatorError> {
        let mut memberships = self
            .memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match memberships.get(participant_id) {
            Some(existing) if existing == room_id => Ok(false),
            Some(other) => Err(CoordinatorError::Conflict(format!(
                "{participant_id} is already in room {other}"
            ))),
            None => {
                memberships.insert(participant_id.to_string(), room_id.to_string());
                Ok(true)
            }
        }
    }

    /// Drop the membership if it still points at `room_id`.
    pub fn forget_membership(&self, participant_id: &str, room_id: &str) {
        let mut memberships = self
            .memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if memberships.get(participant_id).is_some_and(|r| r == room_id) {
            memberships.remove(participant_id);
        }
    }

    /// Handle of the room `participant_id` belongs to.
    ///
    /// # Errors
    ///
    /// `UnknownParticipant` without a membership, `RoomClosed` if the room
    /// has already stopped.
    pub fn room_for(&self, participant_id: &str) -> Result<RoomActorHandle, CoordinatorError> {
        let room_id = self.membership(participant_id).ok_or_else(|| {
            CoordinatorError::UnknownParticipant(format!("{participant_id} is not in a room"))
        })?;
        self.live_handle(&room_id)
            .map(|(handle, _)| handle)
            .ok_or_else(|| CoordinatorError::RoomClosed(format!("room {room_id} is closed")))
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Join `room_id`, creating it on first use.
    ///
    /// # Errors
    ///
    /// `Conflict` if the participant is in another room; otherwise whatever
    /// room creation or the room's admission check returns.
    #[instrument(skip_all, fields(room_id = %room_id, participant_id = %request.participant_id))]
    pub async fn add_participant(
        &self,
        room_id: &str,
        class_ref: &str,
        request: JoinRequest,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let participant_id = request.participant_id.clone();
        let claimed = self.claim_membership(&participant_id, room_id)?;

        let result = self.join_with_retry(room_id, class_ref, request).await;
        if result.is_err() && claimed {
            self.forget_membership(&participant_id, room_id);
            self.reclaim_if_empty(room_id).await;
        }
        result
    }

    async fn join_with_retry(
        &self,
        room_id: &str,
        class_ref: &str,
        request: JoinRequest,
    ) -> Result<JoinOutcome, CoordinatorError> {
        let handle = self.get_or_create(room_id, class_ref).await?;
        match handle.join(request.clone()).await {
            Err(CoordinatorError::RoomClosed(_)) => {
                debug!(
                    target: "sc.registry",
                    room_id = %room_id,
                    "Room closed during join, retrying against a fresh room"
                );
                self.evict_if_closed(room_id);
                let handle = self.get_or_create(room_id, class_ref).await?;
                handle.join(request).await
            }
            other => other,
        }
    }

    /// Remove a participant (joined or waiting) and close their engine objects.
    ///
    /// # Errors
    ///
    /// `UnknownParticipant` if the participant is in no room.
    #[instrument(skip_all, fields(participant_id = %participant_id, reason = reason.as_str()))]
    pub async fn remove_participant(
        &self,
        participant_id: &str,
        reason: LeaveReason,
    ) -> Result<LeaveOutcome, CoordinatorError> {
        let room_id = self.membership(participant_id).ok_or_else(|| {
            CoordinatorError::UnknownParticipant(format!("{participant_id} is not in a room"))
        })?;

        let outcome = match self.live_handle(&room_id) {
            Some((handle, _)) => match handle.leave(participant_id, reason).await {
                Ok(outcome) => outcome,
                Err(CoordinatorError::RoomClosed(_)) => LeaveOutcome::NotPresent,
                Err(e) => return Err(e),
            },
            None => LeaveOutcome::NotPresent,
        };
        self.forget_membership(participant_id, &room_id);

        if let LeaveOutcome::Left {
            producers,
            transports,
        } = &outcome
        {
            self.close_engine_objects(producers, transports).await;
        }
        self.reclaim_if_empty(&room_id).await;
        Ok(outcome)
    }

    /// Best-effort engine cleanup for a departed participant.
    async fn close_engine_objects(&self, producers: &[ProducerRef], transports: &[String]) {
        let closing = producers
            .iter()
            .map(|p| self.engine.close_producer(&p.producer_id));
        for result in futures::future::join_all(closing).await {
            if let Err(e) = result {
                warn!(target: "sc.registry", error = %e, "Failed to close producer");
            }
        }
        let closing = transports.iter().map(|id| self.engine.close_transport(id));
        for result in futures::future::join_all(closing).await {
            if let Err(e) = result {
                warn!(target: "sc.registry", error = %e, "Failed to close transport");
            }
        }
    }

    /// Close and evict the room if nobody is joined or waiting.
    pub async fn reclaim_if_empty(&self, room_id: &str) {
        let Some((handle, generation)) = self.live_handle(room_id) else {
            self.evict_if_closed(room_id);
            return;
        };
        match handle.close_if_empty().await {
            Ok(false) => {}
            Ok(true) | Err(_) => self.evict(room_id, generation),
        }
    }

    fn evict(&self, room_id: &str, generation: u64) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(room_id)
            .is_some_and(|managed| managed.generation == generation)
        {
            rooms.remove(room_id);
            self.metrics.room_removed();
            info!(
                target: "sc.registry",
                room_id = %room_id,
                generation,
                room_count = rooms.len(),
                "Room reclaimed"
            );
        }
    }

    fn evict_if_closed(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(room_id)
            .is_some_and(|managed| managed.handle.is_closed())
        {
            rooms.remove(room_id);
            self.metrics.room_removed();
        }
    }

    /// Point-in-time view of one room.
    ///
    /// # Errors
    ///
    /// `UnknownRoom` if the room is not live here.
    pub async fn roster_snapshot(&self, room_id: &str) -> Result<RosterSnapshot, CoordinatorError> {
        let (handle, _) = self
            .live_handle(room_id)
            .ok_or_else(|| CoordinatorError::UnknownRoom(room_id.to_string()))?;
        handle.roster_snapshot().await
    }

    // ------------------------------------------------------------------
    // Supervision and shutdown
    // ------------------------------------------------------------------

    /// Periodically reap finished room tasks until cancelled.
    pub async fn run_supervisor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SUPERVISOR_INTERVAL);
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = interval.tick() => self.check_room_health().await,
            }
        }
        debug!(target: "sc.registry", "Supervisor stopped");
    }

    /// Evict rooms whose task ended and restart crashed quality adapters.
    pub async fn check_room_health(&self) {
        let mut finished = Vec::new();
        let mut crashed_adapters = Vec::new();
        {
            let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
            let done: Vec<String> = rooms
                .iter()
                .filter(|(_, managed)| managed.task_handle.is_finished())
                .map(|(room_id, _)| room_id.clone())
                .collect();
            for room_id in done {
                if let Some(managed) = rooms.remove(&room_id) {
                    finished.push((room_id, managed));
                }
            }
            for (room_id, managed) in rooms.iter_mut() {
                if managed.quality_task.is_finished() && !managed.handle.is_cancelled() {
                    let restarted = self.spawn_quality(&managed.handle);
                    let old = std::mem::replace(&mut managed.quality_task, restarted);
                    crashed_adapters.push((room_id.clone(), old));
                }
            }
        }

        for (room_id, managed) in finished {
            managed.quality_task.abort();
            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sc.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sc.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
            self.metrics.room_removed();
            self.purge_memberships(&room_id);
        }

        for (room_id, task) in crashed_adapters {
            if let Err(join_error) = task.await {
                if join_error.is_panic() {
                    self.metrics.record_panic(ActorType::Quality);
                }
            }
            warn!(
                target: "sc.registry",
                room_id = %room_id,
                "Quality adapter stopped unexpectedly, restarted"
            );
        }
    }

    fn purge_memberships(&self, room_id: &str) {
        self.memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, member_room| member_room != room_id);
    }

    /// Stop accepting rooms, cancel every room and wait up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();

        let drained: Vec<(String, ManagedRoom)> = self
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        info!(
            target: "sc.registry",
            room_count = drained.len(),
            "Draining rooms"
        );

        let room_count = drained.len();
        let waits = drained.into_iter().map(|(room_id, managed)| async move {
            let _ = managed.quality_task.await;
            (room_id, managed.task_handle.await)
        });
        match tokio::time::timeout(deadline, futures::future::join_all(waits)).await {
            Ok(results) => {
                for (room_id, result) in results {
                    if let Err(e) = result {
                        warn!(
                            target: "sc.registry",
                            room_id = %room_id,
                            error = ?e,
                            "Room actor panicked during shutdown"
                        );
                    }
                }
            }
            Err(_) => {
                warn!(
                    target: "sc.registry",
                    deadline_secs = deadline.as_secs(),
                    "Room shutdown timed out"
                );
            }
        }

        for _ in 0..room_count {
            self.metrics.room_removed();
        }
        self.memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(target: "sc.registry", "Registry shutdown complete");
    }
}
