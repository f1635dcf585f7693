//! Projection store double with failure injection.

use async_trait::async_trait;
use session_coordinator::admission::ClassPolicy;
use session_coordinator::persistence::{PersistenceError, ProjectionStore, RoomProjection};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory store that can be made unreachable and records every write.
#[derive(Debug, Default)]
pub struct MockProjectionStore {
    policies: Mutex<HashMap<String, ClassPolicy>>,
    published: Mutex<Vec<RoomProjection>>,
    removed: Mutex<Vec<String>>,
    policy_unavailable: AtomicBool,
    publish_unavailable: AtomicBool,
}

impl MockProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_policy(self, class_ref: &str, policy: ClassPolicy) -> Self {
        self.policies
            .lock()
            .unwrap()
            .insert(class_ref.to_string(), policy);
        self
    }

    /// Make class record lookups fail.
    pub fn set_policy_unavailable(&self, unavailable: bool) {
        self.policy_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make projection writes fail.
    pub fn set_publish_unavailable(&self, unavailable: bool) {
        self.publish_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every projection successfully published, oldest first.
    pub fn published(&self) -> Vec<RoomProjection> {
        self.published.lock().unwrap().clone()
    }

    /// Latest projection published for `room_id`.
    pub fn latest(&self, room_id: &str) -> Option<RoomProjection> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.room_id == room_id)
            .cloned()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProjectionStore for MockProjectionStore {
    async fn load_class_policy(
        &self,
        class_ref: &str,
    ) -> Result<Option<ClassPolicy>, PersistenceError> {
        if self.policy_unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("class store offline".to_string()));
        }
        Ok(self.policies.lock().unwrap().get(class_ref).cloned())
    }

    async fn publish(&self, projection: &RoomProjection) -> Result<(), PersistenceError> {
        if self.publish_unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("projection store offline".to_string()));
        }
        self.published.lock().unwrap().push(projection.clone());
        Ok(())
    }

    async fn remove(&self, room_id: &str) -> Result<(), PersistenceError> {
        if self.publish_unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("projection store offline".to_string()));
        }
        self.removed.lock().unwrap().push(room_id.to_string());
        Ok(())
    }
}
