//! Moderator actions: waiting-room decisions and capability grants.
//!
//! The room actor owns the permission flags and decides every change;
//! this layer resolves the moderator's room, closes force-closed producers
//! on the media engine and keeps the membership index in step with denials.

use crate::actors::PermissionOutcome;
use crate::errors::CoordinatorError;
use crate::media_engine::MediaEngine;
use crate::observability::metrics;
use crate::registry::RoomRegistry;
use common::types::Capability;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Applies moderator decisions to the moderator's current room.
#[derive(Clone)]
pub struct PermissionController {
    registry: Arc<RoomRegistry>,
    engine: Arc<dyn MediaEngine>,
}

impl PermissionController {
    pub fn new(registry: Arc<RoomRegistry>, engine: Arc<dyn MediaEngine>) -> Self {
        Self { registry, engine }
    }

    /// Admit a waiting participant.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-moderators, `Validation` if the target is
    /// not waiting.
    #[instrument(skip_all, fields(moderator_id = %moderator_id, participant_id = %participant_id))]
    pub async fn approve(
        &self,
        moderator_id: &str,
        participant_id: &str,
    ) -> Result<(), CoordinatorError> {
        let room = self.registry.room_for(moderator_id)?;
        room.approve(moderator_id, participant_id).await
    }

    /// Turn a waiting participant away. They may join again later.
    ///
    /// # Errors
    ///
    /// Same as [`approve`](Self::approve).
    #[instrument(skip_all, fields(moderator_id = %moderator_id, participant_id = %participant_id))]
    pub async fn deny(&self, moderator_id: &str, participant_id: &str) -> Result<(), CoordinatorError> {
        let room = self.registry.room_for(moderator_id)?;
        room.deny(moderator_id, participant_id).await?;
        self.registry
            .forget_membership(participant_id, room.room_id());
        Ok(())
    }

    /// Grant `capability` to a joined participant.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for non-moderators, `UnknownParticipant` if the
    /// target is not joined in the moderator's room.
    pub async fn grant_permission(
        &self,
        moderator_id: &str,
        participant_id: &str,
        capability: Capability,
    ) -> Result<(), CoordinatorError> {
        self.set_permission(moderator_id, participant_id, capability, true)
            .await
    }

    /// Revoke `capability`, closing the matching producer if one is live.
    ///
    /// # Errors
    ///
    /// As [`grant_permission`](Self::grant_permission); additionally
    /// `PermissionDenied` when the target is another moderator.
    pub async fn revoke_permission(
        &self,
        moderator_id: &str,
        participant_id: &str,
        capability: Capability,
    ) -> Result<(), CoordinatorError> {
        self.set_permission(moderator_id, participant_id, capability, false)
            .await
    }

    #[instrument(
        skip_all,
        fields(
            moderator_id = %moderator_id,
            participant_id = %participant_id,
            capability = capability.as_str(),
            granted = granted
        )
    )]
    async fn set_permission(
        &self,
        moderator_id: &str,
        participant_id: &str,
        capability: Capability,
        granted: bool,
    ) -> Result<(), CoordinatorError> {
        let action = if granted { "grant" } else { "revoke" };
        let room = self.registry.room_for(moderator_id)?;

        let outcome = match room
            .set_permission(moderator_id, participant_id, capability, granted)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, CoordinatorError::PermissionDenied(_)) {
                    metrics::record_permission_change(action, "denied");
                }
                return Err(e);
            }
        };

        match outcome {
            PermissionOutcome::Unchanged => {
                metrics::record_permission_change(action, "unchanged");
            }
            PermissionOutcome::Applied { closed_producers } => {
                metrics::record_permission_change(action, "applied");
                for producer in &closed_producers {
                    if let Err(e) = self.engine.close_producer(&producer.producer_id).await {
                        warn!(
                            target: "sc.audit",
                            producer_id = %producer.producer_id,
                            error = %e,
                            "Revoked producer could not be closed on engine"
                        );
                    }
                }
                info!(
                    target: "sc.audit",
                    room_id = %room.room_id(),
                    moderator_id = %moderator_id,
                    participant_id = %participant_id,
                    capability = capability.as_str(),
                    action,
                    producers_closed = closed_producers.len(),
                    "Permission applied"
                );
            }
        }
        Ok(())
    }

    /// Ask the room's moderators for `capability`. Repeats are collapsed.
    ///
    /// # Errors
    ///
    /// `UnknownParticipant` if the caller is not joined.
    pub async fn request_permission(
        &self,
        participant_id: &str,
        capability: Capability,
    ) -> Result<(), CoordinatorError> {
        let room = self.registry.room_for(participant_id)?;
        room.request_permission(participant_id, capability).await
    }

    /// Toggle the caller's own audio/video flags.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when turning on media without the capability.
    pub async fn update_media_state(
        &self,
        participant_id: &str,
        audio: bool,
        video: bool,
    ) -> Result<(), CoordinatorError> {
        let room = self.registry.room_for(participant_id)?;
        room.update_media_state(participant_id, audio, video).await
    }
}
