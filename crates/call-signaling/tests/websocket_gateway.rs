//! End-to-end tests for the WebSocket gateway.
//!
//! Each test spawns a real listener on 127.0.0.1:0 and talks to it over
//! `tokio-tungstenite`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_signaling::protocol::{
    ClientRequest, ErrorCode, LeaveReason, NetworkQuality, ServerMessage,
};
use cs_test_utils::{TestKeypair, TestSignalingClient, TestSignalingServer};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

fn join(room_id: &str) -> ClientRequest {
    ClientRequest::JoinCall {
        room_id: room_id.to_string(),
        user_id: None,
        display_name: None,
        audio_enabled: true,
        video_enabled: true,
    }
}

async fn welcomed(server: &TestSignalingServer, user_id: &str) -> (TestSignalingClient, String) {
    let mut client = server.connect(user_id).await.unwrap();
    match client.recv().await.unwrap() {
        ServerMessage::Welcome {
            connection_id,
            user_id: welcomed_as,
        } => {
            assert_eq!(welcomed_as, user_id);
            (client, connection_id)
        }
        other => unreachable!("expected Welcome, got {other:?}"),
    }
}

fn error_code(message: &ServerMessage) -> Option<ErrorCode> {
    match message {
        ServerMessage::Error { code, .. } => Some(*code),
        _ => None,
    }
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_token_is_refused_with_401() {
    let server = TestSignalingServer::spawn().await.unwrap();

    let status = TestSignalingClient::connect_rejected(&server.ws_url(), None).await;
    assert_eq!(status, Some(401));
}

#[tokio::test]
async fn test_expired_and_forged_tokens_are_refused() {
    let server = TestSignalingServer::spawn().await.unwrap();

    let expired = server.keypair().expired_token_for("alice");
    let status = TestSignalingClient::connect_rejected(&server.ws_url(), Some(&expired)).await;
    assert_eq!(status, Some(401));

    let forger = TestKeypair::from_seed(7).unwrap();
    let forged = forger.token_for("alice", None);
    let status = TestSignalingClient::connect_rejected(&server.ws_url(), Some(&forged)).await;
    assert_eq!(status, Some(401));
}

#[tokio::test]
async fn test_bearer_header_is_accepted() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let token = server.keypair().token_for("alice", Some("Alice"));

    let mut request = server.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {token}").parse().unwrap());

    let (mut stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let frame = futures::StreamExt::next(&mut stream).await.unwrap().unwrap();
    let welcome: ServerMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert!(matches!(
        welcome,
        ServerMessage::Welcome { ref user_id, .. } if user_id == "alice"
    ));
}

// ============================================================================
// Signaling
// ============================================================================

#[tokio::test]
async fn test_join_and_relay_end_to_end() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;
    let (mut bob, _) = welcomed(&server, "bob").await;

    alice.request(1, &join("room-1")).await.unwrap();
    match alice.recv().await.unwrap() {
        ServerMessage::RoomState { request_id, room } => {
            assert_eq!(request_id, Some(1));
            assert_eq!(room.participants.len(), 1);
        }
        other => unreachable!("expected RoomState, got {other:?}"),
    }

    bob.request(1, &join("room-1")).await.unwrap();
    let bob_state = bob.recv().await.unwrap();
    assert!(matches!(
        bob_state,
        ServerMessage::RoomState { ref room, .. } if room.participant("alice").is_some()
    ));

    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerMessage::UserJoined { ref participant, .. } if participant.user_id == "bob"
    ));

    alice
        .request(
            2,
            &ClientRequest::SendOffer {
                room_id: "room-1".to_string(),
                to_user_id: "bob".to_string(),
                sdp: "v=0 offer".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        alice.recv().await.unwrap(),
        ServerMessage::Ack { request_id: Some(2) }
    );
    assert_eq!(
        bob.recv().await.unwrap(),
        ServerMessage::ReceiveOffer {
            room_id: "room-1".to_string(),
            from_user_id: "alice".to_string(),
            sdp: "v=0 offer".to_string(),
        }
    );

    bob.request(
        2,
        &ClientRequest::SendAnswer {
            room_id: "room-1".to_string(),
            to_user_id: "alice".to_string(),
            sdp: "v=0 answer".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        bob.recv().await.unwrap(),
        ServerMessage::Ack { request_id: Some(2) }
    );
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerMessage::ReceiveAnswer { ref from_user_id, .. } if from_user_id == "bob"
    ));
}

#[tokio::test]
async fn test_leave_notifies_peer() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;
    let (mut bob, _) = welcomed(&server, "bob").await;

    alice.request(1, &join("room-1")).await.unwrap();
    alice.recv().await.unwrap();
    bob.request(1, &join("room-1")).await.unwrap();
    bob.recv().await.unwrap();

    bob.request(
        2,
        &ClientRequest::LeaveCall {
            room_id: "room-1".to_string(),
            user_id: None,
            reason: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(
        bob.recv().await.unwrap(),
        ServerMessage::Ack { request_id: Some(2) }
    );

    let left = alice
        .recv_until(|m| matches!(m, ServerMessage::UserLeft { .. }))
        .await
        .unwrap();
    assert_eq!(
        left,
        ServerMessage::UserLeft {
            room_id: "room-1".to_string(),
            user_id: "bob".to_string(),
            reason: LeaveReason::Voluntary,
        }
    );
}

#[tokio::test]
async fn test_dropped_channel_then_reconnect() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, alice_connection) = welcomed(&server, "alice").await;
    let (mut bob, _) = welcomed(&server, "bob").await;

    alice.request(1, &join("room-1")).await.unwrap();
    alice.recv().await.unwrap();
    bob.request(1, &join("room-1")).await.unwrap();
    bob.recv().await.unwrap();

    alice.abort();
    assert_eq!(
        bob.recv().await.unwrap(),
        ServerMessage::UserDisconnected {
            room_id: "room-1".to_string(),
            user_id: "alice".to_string(),
        }
    );

    let (mut alice, _) = welcomed(&server, "alice").await;
    alice
        .request(
            5,
            &ClientRequest::ReconnectToCall {
                room_id: "room-1".to_string(),
                user_id: Some("alice".to_string()),
                previous_connection_id: alice_connection,
                display_name: None,
                audio_enabled: None,
                video_enabled: None,
            },
        )
        .await
        .unwrap();

    match alice.recv().await.unwrap() {
        ServerMessage::RoomState { request_id, room } => {
            assert_eq!(request_id, Some(5));
            assert_eq!(room.participants.len(), 2);
        }
        other => unreachable!("expected RoomState, got {other:?}"),
    }

    assert_eq!(
        bob.recv().await.unwrap(),
        ServerMessage::UserReconnected {
            room_id: "room-1".to_string(),
            user_id: "alice".to_string(),
            network_quality: NetworkQuality::Good,
        }
    );
    assert!(bob
        .recv_within(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Protocol errors
// ============================================================================

#[tokio::test]
async fn test_malformed_and_binary_frames_keep_channel_open() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;

    alice.send_raw("{not json").await.unwrap();
    let reply = alice.recv().await.unwrap();
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidPayload));

    alice
        .send_raw(r#"{"type":"Teleport","requestId":11}"#)
        .await
        .unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerMessage::Error {
            request_id: Some(11),
            code: ErrorCode::InvalidPayload,
            ..
        }
    ));

    alice.send_binary(vec![1, 2, 3]).await.unwrap();
    let reply = alice.recv().await.unwrap();
    assert_eq!(error_code(&reply), Some(ErrorCode::InvalidPayload));

    alice.request(12, &ClientRequest::Ping).await.unwrap();
    assert_eq!(
        alice.recv().await.unwrap(),
        ServerMessage::Pong {
            request_id: Some(12)
        }
    );
}

#[tokio::test]
async fn test_spoofed_user_id_is_forbidden() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;

    alice
        .request(
            3,
            &ClientRequest::UpdateMediaState {
                room_id: "room-1".to_string(),
                user_id: Some("bob".to_string()),
                audio_enabled: Some(false),
                video_enabled: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerMessage::Error {
            request_id: Some(3),
            code: ErrorCode::Forbidden,
            ..
        }
    ));
}

#[tokio::test]
async fn test_room_state_for_unknown_room() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;

    alice
        .request(
            4,
            &ClientRequest::GetRoomState {
                room_id: "nowhere".to_string(),
            },
        )
        .await
        .unwrap();
    let reply = alice.recv().await.unwrap();
    assert_eq!(error_code(&reply), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_ice_configuration_from_static_list() {
    let server = TestSignalingServer::spawn().await.unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;

    alice
        .request(6, &ClientRequest::GetIceConfiguration)
        .await
        .unwrap();

    match alice.recv().await.unwrap() {
        ServerMessage::IceConfiguration {
            request_id,
            configuration,
        } => {
            assert_eq!(request_id, Some(6));
            let urls: Vec<_> = configuration
                .ice_servers
                .iter()
                .flat_map(|s| s.urls.iter())
                .collect();
            assert!(urls.iter().any(|u| u.as_str() == "stun:stun.test.local:3478"));
        }
        other => unreachable!("expected IceConfiguration, got {other:?}"),
    }
}

#[tokio::test]
async fn test_room_capacity_over_the_wire() {
    let server = TestSignalingServer::spawn_with(&[("CS_DEFAULT_MAX_PARTICIPANTS", "1")])
        .await
        .unwrap();
    let (mut alice, _) = welcomed(&server, "alice").await;
    let (mut bob, _) = welcomed(&server, "bob").await;

    alice.request(1, &join("room-1")).await.unwrap();
    assert!(matches!(
        alice.recv().await.unwrap(),
        ServerMessage::RoomState { .. }
    ));

    bob.request(1, &join("room-1")).await.unwrap();
    let reply = bob.recv().await.unwrap();
    assert_eq!(error_code(&reply), Some(ErrorCode::RoomFull));
}
