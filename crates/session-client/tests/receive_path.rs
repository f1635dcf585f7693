//! Receive path scenarios: retry bounds, closure races and snapshot
//! convergence, driven on paused time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::error::ErrorCategory;
use common::signaling::ServerMessage;
use common::types::{MediaKind, PermissionSet, ProducerRef, ProducerState, ScalabilityPolicy};
use session_client::backend::mock::MockConsumeBackend;
use session_client::{
    ClientError, ConsumerEvent, ConsumerRetryEngine, ParticipantSession, Readiness, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct Harness {
    backend: Arc<MockConsumeBackend>,
    session: ParticipantSession,
    events: mpsc::Receiver<ConsumerEvent>,
}

fn harness(readiness: Readiness) -> Harness {
    let backend = Arc::new(MockConsumeBackend::new());
    let (ready_tx, ready_rx) = watch::channel(readiness);
    let (engine, events) = ConsumerRetryEngine::new(
        backend.clone(),
        RetryPolicy::default(),
        ready_rx,
        CancellationToken::new(),
    );
    Harness {
        backend,
        session: ParticipantSession::new(engine, ready_tx),
        events,
    }
}

fn producer(id: &str, owner: &str) -> ProducerRef {
    ProducerRef {
        producer_id: id.to_string(),
        owner_id: owner.to_string(),
        kind: MediaKind::Video,
        state: ProducerState::Active,
    }
}

fn join_response(self_id: &str, revision: u64, producers: Vec<ProducerRef>) -> ServerMessage {
    ServerMessage::JoinResponse {
        room_id: "room-1".to_string(),
        participant_id: self_id.to_string(),
        rtp_capabilities: serde_json::json!({"codecs": []}),
        existing_producers: producers,
        revision,
        permissions: PermissionSet::default(),
        participants: Vec::new(),
        policy: ScalabilityPolicy {
            max_video_streams: 25,
            audio_only_recommended: false,
            bandwidth_limit_kbps: 2_500,
        },
    }
}

fn new_producer(id: &str, peer: &str) -> ServerMessage {
    ServerMessage::NewProducer {
        producer_id: id.to_string(),
        peer_id: peer.to_string(),
        kind: MediaKind::Video,
    }
}

fn producer_closed(id: &str, peer: &str) -> ServerMessage {
    ServerMessage::ProducerClosed {
        producer_id: id.to_string(),
        peer_id: peer.to_string(),
        kind: MediaKind::Video,
    }
}

async fn next_event(events: &mut mpsc::Receiver<ConsumerEvent>) -> ConsumerEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("no event")
        .expect("channel closed")
}

/// Collect the next `count` events.
async fn take_events(events: &mut mpsc::Receiver<ConsumerEvent>, count: usize) -> Vec<ConsumerEvent> {
    let mut received = Vec::with_capacity(count);
    for _ in 0..count {
        received.push(next_event(events).await);
    }
    received
}

#[tokio::test(start_paused = true)]
async fn test_nonexistent_producer_is_abandoned_after_bounded_retries() {
    let mut h = harness(Readiness::ready());
    h.backend.always_missing("ghost", 10);
    h.session
        .handle_server_message(&join_response("s1", 1, Vec::new()))
        .await
        .unwrap();

    h.session
        .handle_server_message(&new_producer("ghost", "t1"))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut h.events).await,
        ConsumerEvent::Abandoned {
            producer_id: "ghost".to_string(),
            attempts: 3,
        }
    );
    assert!(!h.session.engine().is_tracking("ghost"));

    // Three attempts, spaced by 250 ms then 500 ms
    let times = h.backend.consume_times("ghost");
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(250) && first_gap < Duration::from_millis(300));
    assert!(second_gap >= Duration::from_millis(500) && second_gap < Duration::from_millis(550));

    // And it stays stopped
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.backend.consume_count("ghost"), 3);

    // The next authoritative list drops it from the cache as well
    h.session
        .handle_server_message(&ServerMessage::ProducerListUpdate {
            revision: 2,
            producers: Vec::new(),
        })
        .await
        .unwrap();
    assert!(!h.session.cache().contains("ghost"));
    assert_eq!(h.backend.consume_count("ghost"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_producer_recovering_within_budget_is_consumed() {
    let mut h = harness(Readiness::ready());
    h.backend.always_missing("p1", 2);
    h.session
        .handle_server_message(&join_response("s1", 1, vec![producer("p1", "t1")]))
        .await
        .unwrap();

    let event = next_event(&mut h.events).await;
    assert!(matches!(
        event,
        ConsumerEvent::TrackReady { ref producer_id, ref peer_id, .. }
            if producer_id == "p1" && peer_id == "t1"
    ));
    assert_eq!(h.backend.consume_count("p1"), 3);
    assert_eq!(h.backend.resumed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closure_during_backoff_stops_retrying() {
    let mut h = harness(Readiness::ready());
    h.backend.always_missing("p1", 10);
    h.session
        .handle_server_message(&join_response("s1", 1, Vec::new()))
        .await
        .unwrap();
    h.session
        .handle_server_message(&new_producer("p1", "t1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.session
        .handle_server_message(&producer_closed("p1", "t1"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.backend.consume_count("p1"), 1);
    assert!(h.events.try_recv().is_err());
    assert!(!h.session.cache().contains("p1"));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_repairs_dropped_events() {
    let mut h = harness(Readiness::ready());
    h.session
        .handle_server_message(&join_response(
            "s1",
            1,
            vec![producer("p1", "t1"), producer("p2", "t2"), producer("own", "s1")],
        ))
        .await
        .unwrap();
    take_events(&mut h.events, 2).await;
    assert_eq!(h.session.engine().tracked(), vec!["p1".to_string(), "p2".to_string()]);

    // Closure of p1 and creation of p3 are lost; the periodic list arrives
    h.session
        .handle_server_message(&ServerMessage::ProducerListUpdate {
            revision: 4,
            producers: vec![producer("p2", "t2"), producer("p3", "t3"), producer("own", "s1")],
        })
        .await
        .unwrap();

    let events = take_events(&mut h.events, 2).await;
    assert!(events.contains(&ConsumerEvent::TrackEnded {
        peer_id: "t1".to_string(),
        producer_id: "p1".to_string(),
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        ConsumerEvent::TrackReady { producer_id, .. } if producer_id == "p3"
    )));
    assert_eq!(h.session.cache().producer_ids(), vec!["p2".to_string(), "p3".to_string()]);
    assert_eq!(h.session.engine().tracked(), vec!["p2".to_string(), "p3".to_string()]);

    // A delayed older list changes nothing
    h.session
        .handle_server_message(&ServerMessage::ProducerListUpdate {
            revision: 3,
            producers: vec![producer("p1", "t1")],
        })
        .await
        .unwrap();
    assert_eq!(h.session.cache().producer_ids(), vec!["p2".to_string(), "p3".to_string()]);
    assert!(!h.session.engine().is_tracking("p1"));
}

fn unchanged_list(revision: u64) -> ServerMessage {
    ServerMessage::ProducerListUpdate {
        revision,
        producers: vec![producer("p1", "t1")],
    }
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_survives_periodic_lists() {
    let mut h = harness(Readiness::ready());
    h.backend.script(
        "p1",
        vec![Err(ClientError::coordinator(
            ErrorCategory::PermanentMedia,
            "codec mismatch",
        ))],
    );
    h.session
        .handle_server_message(&join_response("s1", 1, vec![producer("p1", "t1")]))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        ConsumerEvent::Failed { category: ErrorCategory::PermanentMedia, .. }
    ));

    for revision in 2..=4 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.session
            .handle_server_message(&unchanged_list(revision))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.backend.consume_count("p1"), 1);
    assert!(h.events.try_recv().is_err());

    // Once the producer drops out of the list the failure is forgotten
    h.session
        .handle_server_message(&ServerMessage::ProducerListUpdate {
            revision: 5,
            producers: Vec::new(),
        })
        .await
        .unwrap();
    assert!(!h.session.engine().has_failed("p1"));
    h.session
        .handle_server_message(&unchanged_list(6))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        ConsumerEvent::TrackReady { .. }
    ));
    assert_eq!(h.backend.consume_count("p1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_producer_waits_for_reannouncement() {
    let mut h = harness(Readiness::ready());
    h.backend.always_missing("p1", 6);
    h.session
        .handle_server_message(&join_response("s1", 1, vec![producer("p1", "t1")]))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        ConsumerEvent::Abandoned { attempts: 3, .. }
    ));

    for revision in 2..=4 {
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.session
            .handle_server_message(&unchanged_list(revision))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.backend.consume_count("p1"), 3);

    // A new announcement starts one more bounded cycle
    h.session
        .handle_server_message(&new_producer("p1", "t1"))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut h.events).await,
        ConsumerEvent::Abandoned { attempts: 3, .. }
    ));
    assert_eq!(h.backend.consume_count("p1"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_consumes_wait_for_readiness() {
    let mut h = harness(Readiness::default());
    h.session
        .handle_server_message(&join_response("s1", 1, vec![producer("p1", "t1")]))
        .await
        .unwrap();
    h.session
        .handle_server_message(&new_producer("p2", "t2"))
        .await
        .unwrap();
    assert!(h.session.engine().tracked().is_empty());
    assert_eq!(h.backend.consume_count("p1"), 0);

    let err = h
        .session
        .engine()
        .consume("t1", "p1", MediaKind::Video)
        .unwrap_err();
    assert!(matches!(err, ClientError::NotReady(_)));
    assert_eq!(err.category(), ErrorCategory::Validation);

    h.session
        .set_readiness(Readiness {
            device_loaded: true,
            recv_transport_ready: false,
        })
        .unwrap();
    assert!(h.session.engine().tracked().is_empty());

    h.session.set_readiness(Readiness::ready()).unwrap();
    take_events(&mut h.events, 2).await;
    assert_eq!(h.session.engine().tracked(), vec!["p1".to_string(), "p2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_leave_releases_tracks() {
    let mut h = harness(Readiness::ready());
    h.session
        .handle_server_message(&join_response("s1", 1, vec![producer("p1", "t1")]))
        .await
        .unwrap();
    next_event(&mut h.events).await;

    h.session.leave().await;
    assert!(matches!(
        next_event(&mut h.events).await,
        ConsumerEvent::TrackEnded { .. }
    ));
    assert_eq!(h.backend.closed().len(), 1);
    assert!(h.session.cache().is_empty());
    assert!(h.session.participant_id().is_none());
}
