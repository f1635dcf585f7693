//! Waiting-room admission.
//!
//! Admission is a small state machine:
//!
//! ```text
//! Requesting ──gate──▶ WaitingForApproval ──approve──▶ Admitted ──join──▶ Joined
//!      │                      │  │                                          │
//!      └──bypass──▶ Admitted  │  └──deny──▶ Denied                          └──leave──▶ Left
//!                             └──cancel──▶ Left
//! ```
//!
//! [`ClassPolicy`] decides which edge a join request takes. Moderators skip
//! both the approval gate and the scheduled-start gate.

use crate::errors::CoordinatorError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::signaling::WaitingEntrySummary;
use common::types::{PermissionSet, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Admission lifecycle of one join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Requesting,
    WaitingForApproval,
    Admitted,
    Joined,
    Left,
    Denied,
}

/// Input to [`AdmissionState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// Policy requires a moderator's approval.
    RequireApproval,
    /// Policy admits the requester directly.
    Bypass,
    Approve,
    Deny,
    Join,
    /// Explicit leave, or disconnect while waiting.
    Leave,
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl AdmissionState {
    /// Apply `event`, rejecting edges the machine does not have.
    ///
    /// # Errors
    ///
    /// `Validation` for an illegal transition, e.g. approving a participant
    /// that is not waiting.
    pub fn apply(self, event: AdmissionEvent) -> Result<AdmissionState, CoordinatorError> {
        use AdmissionEvent as E;
        use AdmissionState as S;

        match (self, event) {
            (S::Requesting, E::RequireApproval) => Ok(S::WaitingForApproval),
            (S::Requesting, E::Bypass) | (S::WaitingForApproval, E::Approve) => Ok(S::Admitted),
            (S::WaitingForApproval, E::Deny) => Ok(S::Denied),
            (S::WaitingForApproval, E::Leave) | (S::Joined, E::Leave) => Ok(S::Left),
            (S::Admitted, E::Join) => Ok(S::Joined),
            (state, event) => Err(CoordinatorError::Validation(format!(
                "invalid admission transition: {event} while {state}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AdmissionState::Left | AdmissionState::Denied)
    }
}

/// Per-class admission and media policy.
///
/// Loaded from the class record when a room is created; rooms without a
/// record use [`ClassPolicy::with_defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassPolicy {
    pub approval_required: bool,
    /// Roles admitted without approval. Moderators always are.
    pub auto_allow_roles: HashSet<Role>,
    pub scheduled_start: Option<DateTime<Utc>>,
    /// How early before `scheduled_start` non-moderators may join.
    pub early_join_minutes: i64,
    pub max_participants: Option<usize>,
    /// Students get the mic capability on admission.
    pub students_unmuted: bool,
}

impl Default for ClassPolicy {
    fn default() -> Self {
        Self::with_defaults(true)
    }
}

impl ClassPolicy {
    /// Policy for a room without a class record.
    pub fn with_defaults(approval_required: bool) -> Self {
        Self {
            approval_required,
            auto_allow_roles: Role::MODERATORS.into_iter().collect(),
            scheduled_start: None,
            early_join_minutes: 10,
            max_participants: None,
            students_unmuted: false,
        }
    }

    /// Reject non-moderators arriving before the early-join window opens.
    ///
    /// # Errors
    ///
    /// `Validation` ("class has not started") when too early.
    pub fn check_schedule(&self, role: Role, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if role.is_moderator() {
            return Ok(());
        }
        let Some(start) = self.scheduled_start else {
            return Ok(());
        };
        let opens_at = start - ChronoDuration::minutes(self.early_join_minutes.max(0));
        if now < opens_at {
            return Err(CoordinatorError::Validation(format!(
                "class has not started; joining opens at {}",
                opens_at.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Which edge a join request by `role` takes out of `Requesting`.
    pub fn gate(&self, role: Role) -> AdmissionEvent {
        if role.is_moderator() || !self.approval_required || self.auto_allow_roles.contains(&role)
        {
            AdmissionEvent::Bypass
        } else {
            AdmissionEvent::RequireApproval
        }
    }

    /// Capabilities granted on admission.
    pub fn initial_permissions(&self, role: Role) -> PermissionSet {
        match role {
            Role::Teacher | Role::Admin | Role::Hod | Role::Dean | Role::Assistant => {
                PermissionSet::all()
            }
            Role::Student => PermissionSet {
                mic: self.students_unmuted,
                camera: false,
            },
            Role::Guest => PermissionSet::none(),
        }
    }
}

/// Resolution of a waiting entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingStatus {
    Pending,
    Approved,
    Denied,
}

/// One participant waiting for approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub participant_id: String,
    pub display_name: String,
    pub role: Role,
    pub requested_at: DateTime<Utc>,
    pub status: WaitingStatus,
}

impl WaitingEntry {
    pub fn new(participant_id: &str, display_name: &str, role: Role) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            display_name: display_name.to_string(),
            role,
            requested_at: Utc::now(),
            status: WaitingStatus::Pending,
        }
    }

    pub fn summary(&self) -> WaitingEntrySummary {
        WaitingEntrySummary {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            requested_at: self.requested_at,
        }
    }
}

/// Pending join requests in arrival order.
#[derive(Debug, Default)]
pub struct WaitingRoom {
    entries: Vec<WaitingEntry>,
}

impl WaitingRoom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.position(participant_id).is_some()
    }

    /// 1-based queue position.
    pub fn position(&self, participant_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.participant_id == participant_id)
            .map(|index| index + 1)
    }

    /// Queue a request. A repeated request keeps its original position.
    pub fn enqueue(&mut self, entry: WaitingEntry) -> usize {
        if let Some(position) = self.position(&entry.participant_id) {
            return position;
        }
        self.entries.push(entry);
        self.entries.len()
    }

    /// Remove a pending entry, stamping it with its resolution.
    ///
    /// # Errors
    ///
    /// `Validation` if the participant is not waiting, so each entry is
    /// resolved exactly once.
    pub fn resolve(
        &mut self,
        participant_id: &str,
        status: WaitingStatus,
    ) -> Result<WaitingEntry, CoordinatorError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.participant_id == participant_id)
            .ok_or_else(|| {
                CoordinatorError::Validation(format!("{participant_id} is not waiting"))
            })?;
        let mut entry = self.entries.remove(index);
        entry.status = status;
        Ok(entry)
    }

    /// Drop a request whose participant went away.
    pub fn cancel(&mut self, participant_id: &str) -> Option<WaitingEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.participant_id == participant_id)?;
        Some(self.entries.remove(index))
    }

    pub fn summaries(&self) -> Vec<WaitingEntrySummary> {
        self.entries.iter().map(WaitingEntry::summary).collect()
    }

    /// Drain every entry (room shutdown).
    pub fn drain(&mut self) -> Vec<WaitingEntry> {
        std::mem::take(&mut self.entries)
    }
}
