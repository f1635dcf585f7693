//! Redis-backed projection store.
//!
//! # Key Patterns
//!
//! - `class:{ref}:policy` - class policy record (JSON string)
//! - `room:{id}:projection` - room projection (HASH, expires)

use super::{PersistenceError, ProjectionStore, RoomProjection};
use crate::admission::ClassPolicy;
use common::secret::{ExposeSecret, SecretString};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{error, instrument, warn};

/// Projection hashes expire unless refreshed.
pub const PROJECTION_TTL: Duration = Duration::from_secs(3600);

/// Projection store over a reconnecting Redis connection.
///
/// `ConnectionManager` is cheap to clone; each call clones it instead of
/// sharing through a lock.
#[derive(Clone)]
pub struct RedisProjectionStore {
    connection: ConnectionManager,
}

fn policy_key(class_ref: &str) -> String {
    format!("class:{class_ref}:policy")
}

fn projection_key(room_id: &str) -> String {
    format!("room:{room_id}:projection")
}

impl RedisProjectionStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the URL is invalid or the first connection fails.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, PersistenceError> {
        // The URL may carry credentials; never log it
        let client = redis::Client::open(redis_url.expose_secret()).map_err(|e| {
            error!(target: "sc.persistence", error = %e, "Failed to open Redis client");
            PersistenceError::Unavailable(format!("failed to open Redis client: {e}"))
        })?;

        let connection = client.get_connection_manager().await.map_err(|e| {
            error!(target: "sc.persistence", error = %e, "Failed to connect to Redis");
            PersistenceError::Unavailable(format!("failed to connect to Redis: {e}"))
        })?;

        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl ProjectionStore for RedisProjectionStore {
    #[instrument(skip_all, fields(class_ref = %class_ref))]
    async fn load_class_policy(
        &self,
        class_ref: &str,
    ) -> Result<Option<ClassPolicy>, PersistenceError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(policy_key(class_ref)).await.map_err(|e| {
            warn!(target: "sc.persistence", error = %e, "Failed to read class policy");
            PersistenceError::Unavailable(format!("failed to read class policy: {e}"))
        })?;

        raw.map(|json| {
            serde_json::from_str::<ClassPolicy>(&json)
                .map_err(|e| PersistenceError::Corrupt(format!("class policy: {e}")))
        })
        .transpose()
    }

    #[instrument(skip_all, fields(room_id = %projection.room_id))]
    async fn publish(&self, projection: &RoomProjection) -> Result<(), PersistenceError> {
        let mut conn = self.connection.clone();
        let key = projection_key(&projection.room_id);
        let fields = [
            ("classRef", projection.class_ref.clone()),
            ("roomId", projection.room_id.clone()),
            ("status", projection.status.as_str().to_string()),
            ("participantCount", projection.participant_count.to_string()),
            ("recordingState", projection.recording_state.clone()),
            ("updatedAt", projection.updated_at.to_rfc3339()),
        ];
        #[allow(clippy::cast_possible_wrap)]
        let ttl_seconds = PROJECTION_TTL.as_secs() as i64;

        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| PersistenceError::Unavailable(format!("projection write failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn remove(&self, room_id: &str) -> Result<(), PersistenceError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(projection_key(room_id))
            .await
            .map_err(|e| PersistenceError::Unavailable(format!("projection delete failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_patterns() {
        assert_eq!(policy_key("math-101"), "class:math-101:policy");
        assert_eq!(projection_key("room-7"), "room:room-7:projection");
    }
}
