//! Quality adaptation.
//!
//! One [`QualityAdapter`] task runs next to each room actor. On every tick it
//! reads the room's media inventory, samples engine statistics and:
//!
//! - moves each active video producer between quality tiers
//!   ([`tier::TierController`]);
//! - pauses consumers on a degraded link and resumes them after a cooldown.
//!
//! Roster-size policy lives in [`scalability`] and is applied by the room
//! actor itself.

pub mod scalability;
pub mod tier;

pub use tier::{TierChange, TierController};

use crate::actors::RoomActorHandle;
use crate::errors::CoordinatorError;
use crate::media_engine::{MediaEngine, MediaStats};
use crate::observability::metrics;
use common::types::{ConsumerRef, ConsumerState, MediaKind, ProducerRef, ProducerState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Sampling and degradation settings for the quality adapter.
#[derive(Debug, Clone)]
pub struct QualitySettings {
    pub sample_interval: Duration,
    /// How long a degraded consumer stays paused before auto-resume.
    pub pause_cooldown: Duration,
    /// Packet loss fraction above which a consumer link is degraded.
    pub packet_loss_threshold: f64,
    pub jitter_threshold_ms: f64,
}

impl QualitySettings {
    pub fn is_degraded(&self, stats: &MediaStats) -> bool {
        stats.packet_loss > self.packet_loss_threshold || stats.jitter_ms > self.jitter_threshold_ms
    }
}

/// Per-room quality adapter task.
pub struct QualityAdapter {
    room: RoomActorHandle,
    engine: Arc<dyn MediaEngine>,
    settings: QualitySettings,
    cancel_token: CancellationToken,
    tiers: HashMap<String, TierController>,
    /// Consumers this adapter paused, with the pause time.
    paused: HashMap<String, Instant>,
}

impl QualityAdapter {
    fn new(
        room: RoomActorHandle,
        engine: Arc<dyn MediaEngine>,
        settings: QualitySettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            room,
            engine,
            settings,
            cancel_token,
            tiers: HashMap::new(),
            paused: HashMap::new(),
        }
    }

    /// Spawn the adapter for `room`. It stops when `cancel_token` fires or
    /// the room closes.
    pub fn spawn(
        room: RoomActorHandle,
        engine: Arc<dyn MediaEngine>,
        settings: QualitySettings,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::new(room, engine, settings, cancel_token).run())
    }

    #[instrument(skip_all, name = "sc.quality", fields(room_id = %self.room.room_id()))]
    async fn run(mut self) {
        debug!(target: "sc.quality", room_id = %self.room.room_id(), "QualityAdapter started");

        let period = self.settings.sample_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sample().await {
                        Ok(()) => {}
                        Err(CoordinatorError::RoomClosed(_)) => break,
                        Err(e) => {
                            warn!(
                                target: "sc.quality",
                                room_id = %self.room.room_id(),
                                error = %e,
                                "Quality sample failed"
                            );
                        }
                    }
                }
            }
        }

        debug!(target: "sc.quality", room_id = %self.room.room_id(), "QualityAdapter stopped");
    }

    /// Run one sampling pass over the room's producers and consumers.
    async fn sample(&mut self) -> Result<(), CoordinatorError> {
        let inventory = self.room.media_inventory().await?;
        self.sample_producers(&inventory.producers).await?;
        self.sample_consumers(&inventory.consumers).await
    }

    async fn stats(&self, object_id: &str) -> Option<MediaStats> {
        match self.engine.get_stats(object_id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!(
                    target: "sc.quality",
                    object_id = %object_id,
                    error = %e,
                    "Stats unavailable, skipping"
                );
                None
            }
        }
    }

    async fn sample_producers(&mut self, producers: &[ProducerRef]) -> Result<(), CoordinatorError> {
        let live: HashSet<&str> = producers
            .iter()
            .filter(|p| p.kind == MediaKind::Video)
            .map(|p| p.producer_id.as_str())
            .collect();
        self.tiers.retain(|id, _| live.contains(id.as_str()));

        for producer in producers
            .iter()
            .filter(|p| p.kind == MediaKind::Video && p.state == ProducerState::Active)
        {
            let Some(stats) = self.stats(&producer.producer_id).await else {
                continue;
            };
            let change = self
                .tiers
                .entry(producer.producer_id.clone())
                .or_default()
                .observe(stats.bitrate_bps);

            if let Some(change) = change {
                metrics::record_quality_tier_change(change.direction());
                info!(
                    target: "sc.quality",
                    room_id = %self.room.room_id(),
                    producer_id = %producer.producer_id,
                    from = change.from.as_str(),
                    to = change.to.as_str(),
                    bitrate_bps = stats.bitrate_bps,
                    "Quality tier changed"
                );
                self.room
                    .quality_tier_changed(&producer.producer_id, change.to)
                    .await?;
            }
        }
        Ok(())
    }

    async fn sample_consumers(&mut self, consumers: &[ConsumerRef]) -> Result<(), CoordinatorError> {
        let known: HashSet<&str> = consumers.iter().map(|c| c.consumer_id.as_str()).collect();
        self.paused.retain(|id, _| known.contains(id.as_str()));
        let now = Instant::now();

        for consumer in consumers {
            let consumer_id = consumer.consumer_id.as_str();
            match consumer.state {
                ConsumerState::Active => {
                    // Resumed by its owner in the meantime
                    self.paused.remove(consumer_id);
                    let Some(stats) = self.stats(consumer_id).await else {
                        continue;
                    };
                    if self.settings.is_degraded(&stats) {
                        self.shed(consumer_id, &stats).await?;
                    }
                }
                ConsumerState::Paused => {
                    let due = self
                        .paused
                        .get(consumer_id)
                        .is_some_and(|paused_at| now.duration_since(*paused_at) >= self.settings.pause_cooldown);
                    if due {
                        self.restore(consumer_id).await?;
                    }
                }
                ConsumerState::Pending | ConsumerState::Closed => {}
            }
        }
        Ok(())
    }

    /// Pause a consumer on a degraded link.
    async fn shed(&mut self, consumer_id: &str, stats: &MediaStats) -> Result<(), CoordinatorError> {
        if !self.room.consumer_degraded(consumer_id, true).await? {
            return Ok(());
        }
        match self.engine.pause_consumer(consumer_id).await {
            Ok(()) => {
                metrics::record_consumer_pause();
                self.paused.insert(consumer_id.to_string(), Instant::now());
                info!(
                    target: "sc.quality",
                    room_id = %self.room.room_id(),
                    consumer_id = %consumer_id,
                    packet_loss = stats.packet_loss,
                    jitter_ms = stats.jitter_ms,
                    "Consumer paused for degraded link"
                );
            }
            Err(e) => {
                warn!(
                    target: "sc.quality",
                    room_id = %self.room.room_id(),
                    consumer_id = %consumer_id,
                    error = %e,
                    "Engine pause failed, reverting"
                );
                self.room.consumer_degraded(consumer_id, false).await?;
            }
        }
        Ok(())
    }

    /// Resume a consumer after its cooldown, unless its owner took over.
    async fn restore(&mut self, consumer_id: &str) -> Result<(), CoordinatorError> {
        self.paused.remove(consumer_id);
        if !self.room.consumer_degraded(consumer_id, false).await? {
            return Ok(());
        }
        if let Err(e) = self.engine.resume_consumer(consumer_id).await {
            warn!(
                target: "sc.quality",
                room_id = %self.room.room_id(),
                consumer_id = %consumer_id,
                error = %e,
                "Engine resume failed, retrying after cooldown"
            );
            if self.room.consumer_degraded(consumer_id, true).await? {
                self.paused.insert(consumer_id.to_string(), Instant::now());
            }
            return Ok(());
        }
        info!(
            target: "sc.quality",
            room_id = %self.room.room_id(),
            consumer_id = %consumer_id,
            "Consumer resumed after cooldown"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, JoinRequest, RoomActor, RoomContext};
    use crate::admission::ClassPolicy;
    use crate::config::RoomSettings;
    use crate::media_engine::mock::MockMediaEngine;
    use crate::persistence::InMemoryProjectionStore;
    use crate::presence::{PresenceGateway, OUTBOUND_BUFFER};
    use common::signaling::ServerMessage;
    use common::types::{QualityTier, Role, TransportDirection};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        adapter: QualityAdapter,
        engine: Arc<MockMediaEngine>,
        room: RoomActorHandle,
        teacher_rx: mpsc::Receiver<ServerMessage>,
        student_rx: mpsc::Receiver<ServerMessage>,
        producer_id: String,
        consumer_id: String,
    }

    fn settings() -> QualitySettings {
        QualitySettings {
            sample_interval: Duration::from_secs(5),
            pause_cooldown: Duration::from_secs(10),
            packet_loss_threshold: 0.05,
            jitter_threshold_ms: 30.0,
        }
    }

    /// Teacher producing video, student consuming it with an active consumer.
    async fn fixture() -> Fixture {
        let engine = Arc::new(MockMediaEngine::new());
        let presence = Arc::new(PresenceGateway::new());
        let (room, _task) = RoomActor::spawn(
            RoomContext {
                room_id: "room-q".to_string(),
                class_ref: "room-q".to_string(),
                policy: ClassPolicy::with_defaults(false),
                rtp_capabilities: json!({}),
                settings: RoomSettings {
                    max_participants: 10,
                    approval_required_default: false,
                    producer_list_interval: Duration::from_secs(60),
                    recently_closed_ttl: Duration::from_secs(10),
                },
                engine: engine.clone(),
                presence: presence.clone(),
                store: Arc::new(InMemoryProjectionStore::new()),
                metrics: ActorMetrics::new(),
            },
            CancellationToken::new(),
        );

        let (teacher_tx, teacher_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (student_tx, student_rx) = mpsc::channel(OUTBOUND_BUFFER);
        presence.register("t1", "conn-t1", teacher_tx);
        presence.register("s1", "conn-s1", student_tx);

        for (id, role) in [("t1", Role::Teacher), ("s1", Role::Student)] {
            room.join(JoinRequest {
                participant_id: id.to_string(),
                display_name: id.to_string(),
                role,
            })
            .await
            .unwrap();
        }

        let send = engine
            .create_transport("room-q", TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_transport("room-q", TransportDirection::Recv)
            .await
            .unwrap();
        room.record_transport("t1", &send.transport_id, TransportDirection::Send)
            .await
            .unwrap();
        room.record_transport("s1", &recv.transport_id, TransportDirection::Recv)
            .await
            .unwrap();
        room.transport_connected("s1", &recv.transport_id)
            .await
            .unwrap();

        let producer_id = engine
            .produce(&send.transport_id, MediaKind::Video, json!({}))
            .await
            .unwrap();
        room.producer_created("t1", &send.transport_id, &producer_id, MediaKind::Video)
            .await
            .unwrap();
        let descriptor = engine
            .consume(&recv.transport_id, &producer_id, json!({}))
            .await
            .unwrap();
        let consumer_id = descriptor.consumer_id.clone();
        room.consumer_created("s1", &recv.transport_id, descriptor)
            .await
            .unwrap();
        engine.resume_consumer(&consumer_id).await.unwrap();
        room.update_consumer_state("s1", &consumer_id, ConsumerState::Active)
            .await
            .unwrap();

        let adapter = QualityAdapter::new(
            room.clone(),
            engine.clone(),
            settings(),
            CancellationToken::new(),
        );
        Fixture {
            adapter,
            engine,
            room,
            teacher_rx,
            student_rx,
            producer_id,
            consumer_id,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn stats(bitrate_bps: u64, packet_loss: f64) -> MediaStats {
        MediaStats {
            bitrate_bps,
            packet_loss,
            ..MediaStats::default()
        }
    }

    #[tokio::test]
    async fn test_low_bitrate_downgrades_and_notifies_owner() {
        let mut f = fixture().await;
        f.engine.push_stats(&f.producer_id, stats(400_000, 0.0));
        drain(&mut f.teacher_rx);

        f.adapter.sample().await.unwrap();
        f.adapter.sample().await.unwrap();
        // Tier notifications are fire-and-forget; a query flushes the mailbox
        f.room.roster_snapshot().await.unwrap();

        let notified = drain(&mut f.teacher_rx).into_iter().any(|m| {
            m == ServerMessage::QualityTierChanged {
                producer_id: f.producer_id.clone(),
                tier: QualityTier::Medium,
            }
        });
        assert!(notified);
    }

    #[tokio::test]
    async fn test_stats_failure_is_skipped() {
        let mut f = fixture().await;
        // No stats queued: every lookup fails
        f.adapter.sample().await.unwrap();
        assert!(f.adapter.tiers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_consumer_paused_then_resumed_after_cooldown() {
        let mut f = fixture().await;
        f.engine.push_stats(&f.consumer_id, stats(300_000, 0.2));
        drain(&mut f.student_rx);

        f.adapter.sample().await.unwrap();
        assert!(f.engine.is_consumer_paused(&f.consumer_id));
        let paused = drain(&mut f.student_rx);
        assert!(paused.iter().any(|m| matches!(
            m,
            ServerMessage::ConsumerPaused { reason, .. } if reason == "degraded_link"
        )));

        // Still cooling down
        tokio::time::advance(Duration::from_secs(5)).await;
        f.adapter.sample().await.unwrap();
        assert!(f.engine.is_consumer_paused(&f.consumer_id));

        tokio::time::advance(Duration::from_secs(6)).await;
        f.adapter.sample().await.unwrap();
        assert!(!f.engine.is_consumer_paused(&f.consumer_id));
        assert!(drain(&mut f.student_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::ConsumerResumed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_pause_is_not_auto_resumed() {
        let mut f = fixture().await;
        f.engine.push_stats(&f.consumer_id, stats(300_000, 0.2));
        f.adapter.sample().await.unwrap();

        // Owner pauses explicitly while degraded
        f.room
            .update_consumer_state("s1", &f.consumer_id, ConsumerState::Paused)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        f.adapter.sample().await.unwrap();
        assert!(f.engine.is_consumer_paused(&f.consumer_id));
        assert_eq!(f.engine.call_count("resume_consumer"), 1);
    }

    #[tokio::test]
    async fn test_engine_pause_failure_reverts_consumer() {
        let mut f = fixture().await;
        f.engine.push_stats(&f.consumer_id, stats(300_000, 0.2));
        f.engine.fail(
            "pause_consumer",
            crate::media_engine::MediaEngineError::Unavailable("down".to_string()),
        );

        f.adapter.sample().await.unwrap();

        let inventory = f.room.media_inventory().await.unwrap();
        let consumer = inventory
            .consumers
            .iter()
            .find(|c| c.consumer_id == f.consumer_id)
            .unwrap();
        assert_eq!(consumer.state, ConsumerState::Active);
        assert!(f.adapter.paused.is_empty());
    }
}
