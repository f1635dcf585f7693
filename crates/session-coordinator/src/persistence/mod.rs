//! Best-effort persistence.
//!
//! Two things are persisted outside the process:
//!
//! - class policy records, read once when a room is created;
//! - a room projection `{classRef, roomId, status, participantCount,
//!   recordingState}` for dashboards.
//!
//! Neither is ever consulted for a live session decision. Projection writes
//! are spawned and their failures only logged and counted.

mod redis;

pub use self::redis::RedisProjectionStore;

use crate::admission::ClassPolicy;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Lifecycle status published in the room projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// Only waiting-room entries, nobody admitted yet.
    Waiting,
    Live,
    Closed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Live => "live",
            RoomStatus::Closed => "closed",
        }
    }
}

/// Eventually-consistent room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomProjection {
    pub class_ref: String,
    pub room_id: String,
    pub status: RoomStatus,
    pub participant_count: usize,
    pub recording_state: String,
    pub updated_at: DateTime<Utc>,
}

impl RoomProjection {
    pub fn new(class_ref: &str, room_id: &str, status: RoomStatus, participant_count: usize) -> Self {
        Self {
            class_ref: class_ref.to_string(),
            room_id: room_id.to_string(),
            status,
            participant_count,
            recording_state: "idle".to_string(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Class policy lookup and room projection.
#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Class policy for `class_ref`; `None` when no record exists.
    async fn load_class_policy(
        &self,
        class_ref: &str,
    ) -> Result<Option<ClassPolicy>, PersistenceError>;

    async fn publish(&self, projection: &RoomProjection) -> Result<(), PersistenceError>;

    async fn remove(&self, room_id: &str) -> Result<(), PersistenceError>;
}

/// Publish in the background. Failures are logged and counted.
pub fn spawn_publish(store: Arc<dyn ProjectionStore>, projection: RoomProjection) {
    tokio::spawn(async move {
        let result = if projection.status == RoomStatus::Closed {
            store.remove(&projection.room_id).await
        } else {
            store.publish(&projection).await
        };
        match result {
            Ok(()) => debug!(
                target: "sc.persistence",
                room_id = %projection.room_id,
                status = projection.status.as_str(),
                participant_count = projection.participant_count,
                "Projection published"
            ),
            Err(e) => {
                metrics::record_projection_failure();
                warn!(
                    target: "sc.persistence",
                    room_id = %projection.room_id,
                    error = %e,
                    "Projection publish failed"
                );
            }
        }
    });
}

/// Store used when no Redis is configured.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    policies: RwLock<HashMap<String, ClassPolicy>>,
    projections: RwLock<HashMap<String, RoomProjection>>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_policy(&self, class_ref: &str, policy: ClassPolicy) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_ref.to_string(), policy);
    }

    pub fn projection(&self, room_id: &str) -> Option<RoomProjection> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn load_class_policy(
        &self,
        class_ref: &str,
    ) -> Result<Option<ClassPolicy>, PersistenceError> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_ref)
            .cloned())
    }

    async fn publish(&self, projection: &RoomProjection) -> Result<(), PersistenceError> {
        self.projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(projection.room_id.clone(), projection.clone());
        Ok(())
    }

    async fn remove(&self, room_id: &str) -> Result<(), PersistenceError> {
        self.projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_memory_policy_lookup() {
        let store = InMemoryProjectionStore::new();
        assert!(store.load_class_policy("math-101").await.unwrap().is_none());

        store.insert_policy("math-101", ClassPolicy::with_defaults(false));
        let policy = store.load_class_policy("math-101").await.unwrap().unwrap();
        assert!(!policy.approval_required);
    }

    #[tokio::test]
    async fn test_spawned_publish_and_close() {
        let store = Arc::new(InMemoryProjectionStore::new());
        spawn_publish(
            store.clone(),
            RoomProjection::new("math-101", "room-1", RoomStatus::Live, 3),
        );
        for _ in 0..50 {
            if store.projection("room-1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.projection("room-1").unwrap().participant_count, 3);

        spawn_publish(
            store.clone(),
            RoomProjection::new("math-101", "room-1", RoomStatus::Closed, 0),
        );
        for _ in 0..50 {
            if store.projection("room-1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(store.projection("room-1").is_none());
    }

    #[test]
    fn test_projection_serializes_camel_case() {
        let projection = RoomProjection::new("c1", "r1", RoomStatus::Waiting, 0);
        let json = serde_json::to_value(&projection).unwrap();
        assert_eq!(json["classRef"], "c1");
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["recordingState"], "idle");
    }
}
