//! Transport, producer and consumer negotiation through signaling.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::error::ErrorCategory;
use common::types::{Capability, ConsumerState, MediaKind, ProducerState, TransportDirection};
use sc_test_utils::*;
use session_coordinator::media_engine::MediaEngineError;
use std::collections::HashSet;

fn is_error(reply: &ServerMessage, category: ErrorCategory) -> bool {
    matches!(reply, ServerMessage::Error { category: c, .. } if *c == category)
}

fn open(room_id: &str) -> TestCoordinator {
    TestCoordinator::with_store(
        MockProjectionStore::new().with_policy(room_id, open_class()),
        test_settings(),
    )
}

async fn transport(connection: &mut TestConnection, direction: TransportDirection) -> String {
    let reply = connection.request(create_transport(direction)).await;
    let id = transport_id(&reply).expect("transport created");
    let reply = connection.request(connect_transport(&id)).await;
    assert!(matches!(reply, ServerMessage::TransportConnected { .. }));
    id
}

#[tokio::test]
async fn test_active_producers_match_producing_participants() {
    let coordinator = open("room-1");
    let mut t1 = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;
    let mut s1 = coordinator.join(&TestParticipant::student("s1"), "room-1").await;
    let _s2 = coordinator.join(&TestParticipant::student("s2"), "room-1").await;
    t1.request(grant("s1", Capability::Camera)).await;

    let t1_send = transport(&mut t1, TransportDirection::Send).await;
    let s1_send = transport(&mut s1, TransportDirection::Send).await;
    t1.request(produce(&t1_send, MediaKind::Video)).await;
    t1.request(produce(&t1_send, MediaKind::Audio)).await;
    s1.request(produce(&s1_send, MediaKind::Video)).await;

    // A second video producer on the same participant is refused
    let reply = s1.request(produce(&s1_send, MediaKind::Video)).await;
    assert!(is_error(&reply, ErrorCategory::Validation));

    let check = |roster: &session_coordinator::actors::RosterSnapshot| {
        let active: HashSet<(String, MediaKind)> = roster
            .producers
            .producers
            .iter()
            .filter(|p| p.state == ProducerState::Active)
            .map(|p| (p.owner_id.clone(), p.kind))
            .collect();
        let producing: HashSet<(String, MediaKind)> = roster
            .participants
            .iter()
            .flat_map(|p| {
                p.producers
                    .iter()
                    .filter(|r| r.state == ProducerState::Active)
                    .map(|r| (p.participant_id.clone(), r.kind))
            })
            .collect();
        assert_eq!(active, producing);
        active.len()
    };

    let roster = coordinator.registry.roster_snapshot("room-1").await.unwrap();
    assert_eq!(check(&roster), 3);

    t1.request(revoke("s1", Capability::Camera)).await;
    let roster = coordinator.registry.roster_snapshot("room-1").await.unwrap();
    assert_eq!(check(&roster), 2);
}

#[tokio::test]
async fn test_second_transport_replaces_first() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;

    let first = transport(&mut teacher, TransportDirection::Send).await;
    let reply = teacher.request(produce(&first, MediaKind::Video)).await;
    let producer = producer_id(&reply).unwrap();

    let second = transport(&mut teacher, TransportDirection::Send).await;
    assert_ne!(first, second);
    assert!(coordinator.engine.closed_transports().contains(&first));
    assert!(coordinator.engine.closed_producers().contains(&producer));

    // The replaced transport is no longer usable
    let reply = teacher.request(produce(&first, MediaKind::Video)).await;
    assert!(is_error(&reply, ErrorCategory::Validation));
    let reply = teacher.request(produce(&second, MediaKind::Video)).await;
    assert!(matches!(reply, ServerMessage::ProducerCreated { .. }));
}

#[tokio::test]
async fn test_engine_failure_surfaces_transport_error() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;

    coordinator.engine.fail(
        "create_transport",
        MediaEngineError::Unavailable("sfu restarting".to_string()),
    );
    let reply = teacher
        .request(create_transport(TransportDirection::Send))
        .await;
    assert!(is_error(&reply, ErrorCategory::Transport));

    // No automatic retry: one engine call, and a fresh request succeeds
    assert_eq!(coordinator.engine.call_count("create_transport"), 1);
    coordinator.engine.clear_failure("create_transport");
    let reply = teacher
        .request(create_transport(TransportDirection::Send))
        .await;
    assert!(matches!(reply, ServerMessage::TransportCreated { .. }));
}

#[tokio::test]
async fn test_consume_lifecycle() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-1").await;

    let send = transport(&mut teacher, TransportDirection::Send).await;
    let producer = producer_id(&teacher.request(produce(&send, MediaKind::Video)).await).unwrap();

    // Consuming before a receive transport exists is a validation error
    let reply = student.request(consume(&producer)).await;
    assert!(is_error(&reply, ErrorCategory::Validation));

    transport(&mut student, TransportDirection::Recv).await;
    let reply = student.request(consume(&producer)).await;
    let consumer = match reply {
        ServerMessage::ConsumerCreated { consumer } => consumer,
        other => unreachable!("unexpected reply {other:?}"),
    };
    assert_eq!(consumer.producer_id, producer);

    let state_of = |roster: &session_coordinator::actors::RosterSnapshot| {
        roster
            .participant("s1")
            .unwrap()
            .consumers
            .iter()
            .find(|c| c.consumer_id == consumer.consumer_id)
            .map(|c| c.state)
    };
    let roster = coordinator.registry.roster_snapshot("room-1").await.unwrap();
    assert_eq!(state_of(&roster), Some(ConsumerState::Paused));

    let reply = student
        .request(ClientMessage::ResumeConsumer {
            consumer_id: consumer.consumer_id.clone(),
        })
        .await;
    assert!(matches!(reply, ServerMessage::Ack));
    let roster = coordinator.registry.roster_snapshot("room-1").await.unwrap();
    assert_eq!(state_of(&roster), Some(ConsumerState::Active));
    assert!(!coordinator.engine.is_consumer_paused(&consumer.consumer_id));

    // Owners cannot consume themselves
    let own_recv = transport(&mut teacher, TransportDirection::Recv).await;
    assert!(!own_recv.is_empty());
    let reply = teacher.request(consume(&producer)).await;
    assert!(is_error(&reply, ErrorCategory::Validation));

    // Producer closure removes the consumer
    teacher
        .request(ClientMessage::CloseProducer {
            producer_id: producer.clone(),
        })
        .await;
    let roster = coordinator.registry.roster_snapshot("room-1").await.unwrap();
    assert_eq!(state_of(&roster), None);
}

#[tokio::test]
async fn test_rejected_rtp_capabilities_are_permanent() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-1").await;

    let send = transport(&mut teacher, TransportDirection::Send).await;
    let producer = producer_id(&teacher.request(produce(&send, MediaKind::Audio)).await).unwrap();
    transport(&mut student, TransportDirection::Recv).await;

    coordinator.engine.fail(
        "consume",
        MediaEngineError::Rejected("no common codec".to_string()),
    );
    let reply = student.request(consume(&producer)).await;
    assert!(is_error(&reply, ErrorCategory::PermanentMedia));
}

#[tokio::test]
async fn test_producer_list_on_request() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-1").await;

    let send = transport(&mut teacher, TransportDirection::Send).await;
    let producer = producer_id(&teacher.request(produce(&send, MediaKind::Video)).await).unwrap();
    student.pushes();

    let reply = student.request(ClientMessage::RequestProducerList).await;
    assert!(matches!(reply, ServerMessage::Ack));
    let list = student
        .expect_push(|m| matches!(m, ServerMessage::ProducerListUpdate { .. }))
        .await;
    assert!(matches!(
        list,
        Some(ServerMessage::ProducerListUpdate { ref producers, .. })
            if producers.len() == 1 && producers.iter().all(|p| p.producer_id == producer)
    ));
}

#[tokio::test]
async fn test_leave_closes_engine_objects() {
    let coordinator = open("room-1");
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-1").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-1").await;

    let send = transport(&mut teacher, TransportDirection::Send).await;
    let producer = producer_id(&teacher.request(produce(&send, MediaKind::Video)).await).unwrap();

    let reply = teacher.request(ClientMessage::LeaveRoom).await;
    assert!(matches!(reply, ServerMessage::Ack));
    assert!(coordinator.engine.closed_producers().contains(&producer));
    assert!(coordinator.engine.closed_transports().contains(&send));
    assert!(!coordinator.presence.is_connected("t1"));

    assert!(student
        .expect_push(|m| matches!(m, ServerMessage::ProducerClosed { producer_id, .. } if *producer_id == producer))
        .await
        .is_some());

    // The connection can join again afterwards
    let reply = teacher.join(&TestParticipant::teacher("t1"), "room-1").await;
    assert!(matches!(reply, ServerMessage::JoinResponse { .. }));
}
