//! In-process coordinator harness.
//!
//! `TestCoordinator` assembles the same components `main.rs` does, minus
//! the sockets. Each `TestConnection` is one signaling session with its
//! outbound queue exposed so tests can observe pushes.

use crate::mock_store::MockProjectionStore;
use crate::fixtures::TestParticipant;
use common::signaling::{ClientMessage, ServerMessage};
use session_coordinator::config::RoomSettings;
use session_coordinator::media_engine::mock::MockMediaEngine;
use session_coordinator::negotiator::SessionNegotiator;
use session_coordinator::permissions::PermissionController;
use session_coordinator::presence::{PresenceGateway, OUTBOUND_BUFFER};
use session_coordinator::quality::QualitySettings;
use session_coordinator::registry::{RegistrySettings, RoomRegistry};
use session_coordinator::signaling::{SignalingSession, SignalingState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long `expect_push` waits by default.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings with short intervals suitable for tests.
pub fn test_settings() -> RegistrySettings {
    RegistrySettings {
        max_rooms: 16,
        room: RoomSettings {
            max_participants: 50,
            approval_required_default: true,
            producer_list_interval: Duration::from_secs(10),
            recently_closed_ttl: Duration::from_secs(10),
        },
        quality: QualitySettings {
            sample_interval: Duration::from_secs(5),
            pause_cooldown: Duration::from_secs(10),
            packet_loss_threshold: 0.05,
            jitter_threshold_ms: 30.0,
        },
    }
}

/// A coordinator wired to in-memory collaborators.
pub struct TestCoordinator {
    pub engine: Arc<MockMediaEngine>,
    pub store: Arc<MockProjectionStore>,
    pub presence: Arc<PresenceGateway>,
    pub registry: Arc<RoomRegistry>,
    pub state: Arc<SignalingState>,
    pub cancel_token: CancellationToken,
    next_connection: AtomicU64,
}

impl Default for TestCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCoordinator {
    pub fn new() -> Self {
        Self::with_store(MockProjectionStore::new(), test_settings())
    }

    pub fn with_store(store: MockProjectionStore, settings: RegistrySettings) -> Self {
        let engine = Arc::new(MockMediaEngine::new());
        let store = Arc::new(store);
        let presence = Arc::new(PresenceGateway::new());
        let cancel_token = CancellationToken::new();
        let registry = Arc::new(RoomRegistry::new(
            engine.clone(),
            store.clone(),
            Arc::clone(&presence),
            settings,
            cancel_token.child_token(),
        ));
        let state = Arc::new(SignalingState {
            negotiator: SessionNegotiator::new(Arc::clone(&registry), engine.clone()),
            permissions: PermissionController::new(Arc::clone(&registry), engine.clone()),
            registry: Arc::clone(&registry),
            presence: Arc::clone(&presence),
            cancel_token: cancel_token.child_token(),
        });
        Self {
            engine,
            store,
            presence,
            registry,
            state,
            cancel_token,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Open a new signaling session.
    pub fn connect(&self) -> TestConnection {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        TestConnection {
            session: SignalingSession::new(Arc::clone(&self.state), format!("conn-{id}"), tx),
            outbound: rx,
        }
    }

    /// Connect and join in one step.
    pub async fn join(&self, participant: &TestParticipant, room_id: &str) -> TestConnection {
        let mut connection = self.connect();
        connection.join(participant, room_id).await;
        connection
    }
}

/// One signaling session plus its outbound queue.
pub struct TestConnection {
    pub session: SignalingSession,
    outbound: mpsc::Receiver<ServerMessage>,
}

impl TestConnection {
    /// Send a request and return the reply.
    pub async fn request(&mut self, message: ClientMessage) -> ServerMessage {
        self.session.handle(message).await
    }

    pub async fn join(&mut self, participant: &TestParticipant, room_id: &str) -> ServerMessage {
        self.request(participant.join_message(room_id)).await
    }

    /// Everything pushed so far, without waiting.
    pub fn pushes(&mut self) -> Vec<ServerMessage> {
        let mut received = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            self.session.on_outbound(&message);
            received.push(message);
        }
        received
    }

    /// Wait for the first push matching `predicate`, skipping others.
    pub async fn expect_push<F>(&mut self, predicate: F) -> Option<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + PUSH_TIMEOUT;
        loop {
            let message = tokio::time::timeout_at(deadline, self.outbound.recv())
                .await
                .ok()??;
            self.session.on_outbound(&message);
            if predicate(&message) {
                return Some(message);
            }
        }
    }

    /// Simulate the socket going away.
    pub async fn disconnect(mut self) {
        self.session.on_disconnect().await;
    }
}

/// Pull the transport id out of a `transportCreated` reply.
pub fn transport_id(reply: &ServerMessage) -> Option<String> {
    match reply {
        ServerMessage::TransportCreated { transport } => Some(transport.transport_id.clone()),
        _ => None,
    }
}

/// Pull the producer id out of a `producerCreated` reply.
pub fn producer_id(reply: &ServerMessage) -> Option<String> {
    match reply {
        ServerMessage::ProducerCreated { producer_id, .. } => Some(producer_id.clone()),
        _ => None,
    }
}
