//! Authoritative producer table for one room.
//!
//! The [`ProducerBroker`] is owned by the room actor, so every mutation is
//! serialized with the rest of the room's state. It enforces one producer
//! per media kind per participant, keeps a revision counter that increases
//! on every structural change, and remembers recently closed producers so
//! consume requests racing a teardown get a retryable answer instead of a
//! permanent one.

use crate::errors::CoordinatorError;
use common::signaling::ServerMessage;
use common::types::{MediaKind, ProducerRef, ProducerState};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Marker for a producer closed within the marker TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedMarker {
    pub producer_id: String,
    pub owner_id: String,
    pub kind: MediaKind,
    pub closed_at: Instant,
}

/// Versioned view of the live producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub revision: u64,
    pub producers: Vec<ProducerRef>,
}

impl ProducerSnapshot {
    pub fn into_message(self) -> ServerMessage {
        ServerMessage::ProducerListUpdate {
            revision: self.revision,
            producers: self.producers,
        }
    }
}

/// Producer table with recently-closed markers.
#[derive(Debug)]
pub struct ProducerBroker {
    /// Live (active or paused) producers by id.
    producers: HashMap<String, ProducerRef>,
    /// Last closed producer per (owner, kind), pruned after `marker_ttl`.
    recently_closed: HashMap<(String, MediaKind), ClosedMarker>,
    revision: u64,
    marker_ttl: Duration,
}

impl ProducerBroker {
    pub fn new(marker_ttl: Duration) -> Self {
        Self {
            producers: HashMap::new(),
            recently_closed: HashMap::new(),
            revision: 0,
            marker_ttl,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn get(&self, producer_id: &str) -> Option<&ProducerRef> {
        self.producers.get(producer_id)
    }

    /// The live producer of `kind` owned by `owner_id`, if any.
    pub fn producer_of(&self, owner_id: &str, kind: MediaKind) -> Option<&ProducerRef> {
        self.producers
            .values()
            .find(|p| p.owner_id == owner_id && p.kind == kind)
    }

    /// Live producers owned by `owner_id`.
    pub fn owned_by(&self, owner_id: &str) -> Vec<ProducerRef> {
        let mut owned: Vec<ProducerRef> = self
            .producers
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        owned
    }

    /// Record a producer the media engine just created.
    ///
    /// # Errors
    ///
    /// `Validation` if the owner already has a live producer of this kind,
    /// `Conflict` if the id is already in use.
    pub fn on_producer_created(
        &mut self,
        owner_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> Result<ProducerRef, CoordinatorError> {
        if self.producers.contains_key(producer_id) {
            return Err(CoordinatorError::Conflict(format!(
                "producer {producer_id} already registered"
            )));
        }
        if self.producer_of(owner_id, kind).is_some() {
            return Err(CoordinatorError::Validation(format!(
                "already producing {kind}; close the existing producer first"
            )));
        }

        let producer = ProducerRef {
            producer_id: producer_id.to_string(),
            owner_id: owner_id.to_string(),
            kind,
            state: ProducerState::Active,
        };
        self.producers
            .insert(producer_id.to_string(), producer.clone());
        self.revision += 1;
        Ok(producer)
    }

    /// Remove a producer and leave a recently-closed marker.
    ///
    /// Returns the removed ref with state `Closed`, or `None` if the id was
    /// not live (closing twice is a no-op).
    pub fn on_producer_closed(&mut self, producer_id: &str, now: Instant) -> Option<ProducerRef> {
        let mut producer = self.producers.remove(producer_id)?;
        producer.state = ProducerState::Closed;
        self.recently_closed.insert(
            (producer.owner_id.clone(), producer.kind),
            ClosedMarker {
                producer_id: producer_id.to_string(),
                owner_id: producer.owner_id.clone(),
                kind: producer.kind,
                closed_at: now,
            },
        );
        self.revision += 1;
        Some(producer)
    }

    /// Pause or reactivate a live producer. Returns whether the state changed.
    pub fn set_state(&mut self, producer_id: &str, state: ProducerState) -> bool {
        if state == ProducerState::Closed {
            return false;
        }
        match self.producers.get_mut(producer_id) {
            Some(producer) if producer.state != state => {
                producer.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn is_recently_closed(&self, producer_id: &str) -> bool {
        self.closed_marker(producer_id).is_some()
    }

    pub fn closed_marker(&self, producer_id: &str) -> Option<&ClosedMarker> {
        self.recently_closed
            .values()
            .find(|marker| marker.producer_id == producer_id)
    }

    /// Marker for the last producer of `kind` closed for `owner_id`.
    pub fn marker_for(&self, owner_id: &str, kind: MediaKind) -> Option<&ClosedMarker> {
        self.recently_closed.get(&(owner_id.to_string(), kind))
    }

    /// Drop markers older than the TTL. Returns how many were dropped.
    pub fn prune_markers(&mut self, now: Instant) -> usize {
        let ttl = self.marker_ttl;
        let before = self.recently_closed.len();
        self.recently_closed
            .retain(|_, marker| now.saturating_duration_since(marker.closed_at) < ttl);
        before - self.recently_closed.len()
    }

    /// Versioned list of live producers, ordered by id.
    pub fn snapshot(&self) -> ProducerSnapshot {
        let mut producers: Vec<ProducerRef> = self.producers.values().cloned().collect();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        ProducerSnapshot {
            revision: self.revision,
            producers,
        }
    }

    /// Live producers other than those owned by `participant_id`.
    pub fn visible_to(&self, participant_id: &str) -> Vec<ProducerRef> {
        self.snapshot()
            .producers
            .into_iter()
            .filter(|p| p.owner_id != participant_id)
            .collect()
    }
}

/// `newProducer` announcement for a freshly created producer.
pub fn announcement(producer: &ProducerRef) -> ServerMessage {
    ServerMessage::NewProducer {
        producer_id: producer.producer_id.clone(),
        peer_id: producer.owner_id.clone(),
        kind: producer.kind,
    }
}

/// `producerClosed` notice for a removed producer.
pub fn closure_notice(producer: &ProducerRef) -> ServerMessage {
    ServerMessage::ProducerClosed {
        producer_id: producer.producer_id.clone(),
        peer_id: producer.owner_id.clone(),
        kind: producer.kind,
    }
}
