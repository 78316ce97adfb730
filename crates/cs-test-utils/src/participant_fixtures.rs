//! Socket-free participants for coordinator tests
//!
//! A `TestParticipant` owns a `ConnectionHandle` and the receiving end of
//! its outbound queue, so tests read exactly what the room would have
//! written to the client.

use call_signaling::actors::{
    ActorMetrics, ConnectionHandle, JoinRequest, RoomRegistryHandle, RoomSettings,
};
use call_signaling::coordinator::CallCoordinator;
use call_signaling::ice::StaticIceConfigProvider;
use call_signaling::protocol::ServerMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Grace period used by [`test_coordinator`].
pub const TEST_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Empty-room idle window used by [`test_coordinator`].
pub const TEST_EMPTY_ROOM_IDLE: Duration = Duration::from_secs(10);

/// One user on one connection.
pub struct TestParticipant {
    user_id: String,
    connection: ConnectionHandle,
    events: mpsc::Receiver<ServerMessage>,
}

impl TestParticipant {
    pub fn new(user_id: &str, connection_id: &str) -> Self {
        let (connection, events) =
            ConnectionHandle::new(connection_id, user_id, CancellationToken::new());
        Self {
            user_id: user_id.to_string(),
            connection,
            events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Join request with both media flags on and an upper-cased display name.
    pub fn join_request(&self) -> JoinRequest {
        JoinRequest {
            user_id: self.user_id.clone(),
            display_name: self.user_id.to_uppercase(),
            connection: self.connection.clone(),
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Next event delivered to this connection.
    pub async fn next(&mut self) -> ServerMessage {
        self.events
            .recv()
            .await
            .expect("connection queue closed while waiting for an event")
    }

    /// Fail if an event is already queued.
    pub fn assert_quiet(&mut self) {
        let pending = self.events.try_recv();
        assert!(pending.is_err(), "unexpected event: {pending:?}");
    }
}

/// Coordinator over a fresh registry with a static, empty ICE list.
pub fn test_coordinator(max_participants: usize) -> CallCoordinator {
    let metrics = ActorMetrics::new();
    let settings = RoomSettings {
        default_max_participants: max_participants,
        grace_period: TEST_GRACE_PERIOD,
        empty_room_idle: TEST_EMPTY_ROOM_IDLE,
    };
    let registry = RoomRegistryHandle::new("cs-test".to_string(), settings, Arc::clone(&metrics));
    CallCoordinator::new(
        registry,
        Arc::new(StaticIceConfigProvider::new(vec![], None)),
        metrics,
    )
}
