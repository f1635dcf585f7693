//! End-to-end classroom scenarios driven through signaling sessions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::error::ErrorCategory;
use common::types::{Capability, MediaKind, TransportDirection};
use sc_test_utils::*;
use session_coordinator::actors::JoinRequest;
use std::time::Duration;

fn is_error(reply: &ServerMessage, category: ErrorCategory) -> bool {
    matches!(reply, ServerMessage::Error { category: c, .. } if *c == category)
}

/// Create, connect and produce on a send transport. Returns the producer id.
async fn start_camera(connection: &mut TestConnection) -> (String, String) {
    let reply = connection
        .request(create_transport(TransportDirection::Send))
        .await;
    let send = transport_id(&reply).expect("send transport");
    let reply = connection.request(connect_transport(&send)).await;
    assert!(matches!(reply, ServerMessage::TransportConnected { .. }));
    let reply = connection.request(produce(&send, MediaKind::Video)).await;
    (send, producer_id(&reply).expect("producer"))
}

#[tokio::test]
async fn test_scenario_a_teacher_opens_empty_room() {
    let coordinator = TestCoordinator::new();
    assert_eq!(coordinator.registry.room_count(), 0);

    let mut teacher = coordinator.connect();
    let reply = teacher.join(&TestParticipant::teacher("t1"), "room-a").await;

    match reply {
        ServerMessage::JoinResponse {
            participant_id,
            participants,
            existing_producers,
            permissions,
            ..
        } => {
            assert_eq!(participant_id, "t1");
            assert_eq!(participants.len(), 1);
            assert!(existing_producers.is_empty());
            assert!(permissions.mic && permissions.camera);
        }
        other => unreachable!("unexpected reply {other:?}"),
    }

    assert_eq!(coordinator.registry.room_count(), 1);
    let roster = coordinator.registry.roster_snapshot("room-a").await.unwrap();
    assert_eq!(roster.participants.len(), 1);
    assert!(roster.waiting.is_empty());
}

#[tokio::test]
async fn test_scenario_b_student_waits_then_is_approved() {
    let coordinator = TestCoordinator::with_store(
        MockProjectionStore::new().with_policy("room-b", moderated_class()),
        test_settings(),
    );
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-b").await;
    let mut student = coordinator.connect();

    let reply = student.join(&TestParticipant::student("s1"), "room-b").await;
    assert!(matches!(
        reply,
        ServerMessage::WaitingForApproval { position: 1, .. }
    ));

    // The teacher learns about the queue
    let update = teacher
        .expect_push(|m| matches!(m, ServerMessage::WaitingRoomUpdate { entries } if entries.len() == 1))
        .await;
    assert!(update.is_some());

    let reply = teacher
        .request(ClientMessage::ApproveParticipant {
            participant_id: "s1".to_string(),
        })
        .await;
    assert!(matches!(reply, ServerMessage::Ack));

    assert!(student
        .expect_push(|m| matches!(m, ServerMessage::WaitingRoomApproved { .. }))
        .await
        .is_some());
    let snapshot = student
        .expect_push(|m| matches!(m, ServerMessage::JoinResponse { .. }))
        .await;
    assert!(matches!(
        snapshot,
        Some(ServerMessage::JoinResponse { ref participants, .. }) if participants.len() == 2
    ));

    let roster = coordinator.registry.roster_snapshot("room-b").await.unwrap();
    assert_eq!(roster.participants.len(), 2);
    assert!(roster.waiting.is_empty());
}

#[tokio::test]
async fn test_scenario_c_revoke_force_closes_camera() {
    let coordinator = TestCoordinator::with_store(
        MockProjectionStore::new().with_policy("room-c", open_class()),
        test_settings(),
    );
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-c").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-c").await;

    let reply = teacher.request(grant("s1", Capability::Camera)).await;
    assert!(matches!(reply, ServerMessage::Ack));
    let (send, p1) = start_camera(&mut student).await;
    assert!(coordinator.engine.is_producer_live(&p1));

    let reply = teacher.request(revoke("s1", Capability::Camera)).await;
    assert!(matches!(reply, ServerMessage::Ack));

    // Flag cleared and producer closed server-side
    let roster = coordinator.registry.roster_snapshot("room-c").await.unwrap();
    let s1 = roster.participant("s1").unwrap();
    assert!(!s1.permissions.camera);
    assert!(s1.producers.is_empty());
    assert!(coordinator.engine.closed_producers().contains(&p1));

    assert!(student
        .expect_push(|m| matches!(
            m,
            ServerMessage::PermissionRevoked { capability: Capability::Camera, .. }
        ))
        .await
        .is_some());
    assert!(teacher
        .expect_push(|m| matches!(m, ServerMessage::ProducerClosed { producer_id, .. } if *producer_id == p1))
        .await
        .is_some());

    // Producing again without a re-grant is refused
    let reply = student.request(produce(&send, MediaKind::Video)).await;
    assert!(is_error(&reply, ErrorCategory::PermissionDenied));
}

#[tokio::test]
async fn test_scenario_d_consume_after_close_is_transient() {
    let coordinator = TestCoordinator::with_store(
        MockProjectionStore::new().with_policy("room-d", open_class()),
        test_settings(),
    );
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-d").await;
    let mut student = coordinator.join(&TestParticipant::student("s1"), "room-d").await;

    let reply = student
        .request(create_transport(TransportDirection::Recv))
        .await;
    let recv = transport_id(&reply).unwrap();
    student.request(connect_transport(&recv)).await;

    let (_, producer) = start_camera(&mut teacher).await;
    assert!(student
        .expect_push(|m| matches!(m, ServerMessage::NewProducer { producer_id, .. } if *producer_id == producer))
        .await
        .is_some());

    // The teacher closes before the student gets around to consuming
    let reply = teacher
        .request(ClientMessage::CloseProducer {
            producer_id: producer.clone(),
        })
        .await;
    assert!(matches!(reply, ServerMessage::Ack));

    for _ in 0..3 {
        let reply = student.request(consume(&producer)).await;
        assert!(is_error(&reply, ErrorCategory::TransientMedia));
    }
    assert_eq!(coordinator.engine.call_count("consume"), 0);
}

#[tokio::test]
async fn test_scenario_e_large_roster_recommends_audio_only() {
    let mut settings = test_settings();
    settings.room.max_participants = 500;
    let coordinator = TestCoordinator::with_store(
        MockProjectionStore::new().with_policy("room-e", open_class()),
        settings,
    );
    let mut teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-e").await;

    for i in 0..119 {
        let student = TestParticipant::student(&format!("s{i}"));
        coordinator
            .registry
            .add_participant(
                "room-e",
                "room-e",
                JoinRequest {
                    participant_id: student.participant_id,
                    display_name: student.display_name,
                    role: student.role,
                },
            )
            .await
            .unwrap();
    }

    let roster = coordinator.registry.roster_snapshot("room-e").await.unwrap();
    assert_eq!(roster.participants.len(), 120);
    assert!(roster.policy.audio_only_recommended);
    assert!(roster.policy.max_video_streams < 25);

    // The teacher was told when the band changed
    let pushed = teacher
        .expect_push(|m| {
            matches!(
                m,
                ServerMessage::ScalabilityPolicyChanged { policy } if policy.audio_only_recommended
            )
        })
        .await;
    assert!(pushed.is_some());
}

#[tokio::test]
async fn test_unreachable_class_store_is_unavailable() {
    let store = MockProjectionStore::new();
    store.set_policy_unavailable(true);
    let coordinator = TestCoordinator::with_store(store, test_settings());

    let mut teacher = coordinator.connect();
    let reply = teacher.join(&TestParticipant::teacher("t1"), "room-x").await;
    assert!(is_error(&reply, ErrorCategory::Unavailable));
    assert_eq!(coordinator.registry.room_count(), 0);
    assert!(!coordinator.presence.is_connected("t1"));
}

#[tokio::test]
async fn test_projection_tracks_room_lifecycle() {
    let coordinator = TestCoordinator::new();
    let teacher = coordinator.join(&TestParticipant::teacher("t1"), "room-p").await;

    let mut published = false;
    for _ in 0..50 {
        published = coordinator
            .store
            .published()
            .iter()
            .any(|p| p.room_id == "room-p" && p.participant_count == 1);
        if published {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(published);

    teacher.disconnect().await;
    for _ in 0..50 {
        if coordinator.store.removed().contains(&"room-p".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(coordinator.store.removed().contains(&"room-p".to_string()));
}
