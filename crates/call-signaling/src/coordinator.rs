//! Call coordinator.
//!
//! Entry point for every client operation after authentication. Resolves
//! rooms through the registry, keeps the connection index in step with
//! membership, and forwards the operation to the owning room actor. All
//! state changes happen inside the room actor; the coordinator holds no
//! room state of its own.
//!
//! A join that races with an idle room closing gets `RoomClosed` from the
//! dying room and is retried once against a fresh one.

use crate::actors::{
    ActorMetrics, JoinRequest, ReconnectRequest, RoomHandle, RoomRegistryHandle, SignalPayload,
};
use crate::errors::SignalingError;
use crate::ice::IceConfigProvider;
use crate::observability::metrics as prom;
use crate::protocol::{IceConfiguration, LeaveReason, NetworkQuality, NetworkStats, RoomSnapshot};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Coordinates client operations across the registry and room actors.
#[derive(Clone)]
pub struct CallCoordinator {
    registry: RoomRegistryHandle,
    ice: Arc<dyn IceConfigProvider>,
    metrics: Arc<ActorMetrics>,
}

impl CallCoordinator {
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        ice: Arc<dyn IceConfigProvider>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            registry,
            ice,
            metrics,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Join a room, creating it on first use.
    ///
    /// # Errors
    ///
    /// `ConnectionInUse`, `RoomFull`, `RoomLocked`, `DuplicateSession`,
    /// `Draining`, or `Internal` on actor failure.
    #[instrument(skip_all, name = "cs.coordinator.join", fields(room_id = %room_id))]
    pub async fn join_call(
        &self,
        room_id: &str,
        request: JoinRequest,
    ) -> Result<RoomSnapshot, SignalingError> {
        let connection_id = request.connection.connection_id().to_string();

        let result = self
            .with_binding(room_id, &connection_id, |room| {
                let request = request.clone();
                async move { room.join(request).await }
            })
            .await;

        prom::record_join(outcome_label(&result));
        result
    }

    /// Resume a participant on a new channel.
    ///
    /// Falls back to a fresh join when the participant was already removed.
    ///
    /// # Errors
    ///
    /// As [`CallCoordinator::join_call`].
    #[instrument(skip_all, name = "cs.coordinator.reconnect", fields(room_id = %room_id))]
    pub async fn reconnect_to_call(
        &self,
        room_id: &str,
        request: ReconnectRequest,
    ) -> Result<RoomSnapshot, SignalingError> {
        let connection_id = request.join.connection.connection_id().to_string();

        self.with_binding(room_id, &connection_id, |room| {
            let request = request.clone();
            async move { room.reconnect(request).await }
        })
        .await
    }

    /// Leave a room. Leaving a room one is not in succeeds.
    ///
    /// # Errors
    ///
    /// `Internal` on actor failure.
    #[instrument(skip_all, name = "cs.coordinator.leave", fields(room_id = %room_id))]
    pub async fn leave_call(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: &str,
        reason: LeaveReason,
    ) -> Result<(), SignalingError> {
        self.remove(room_id, user_id, Some(connection_id), reason)
            .await?;
        self.registry
            .release_connection(connection_id.to_string(), room_id.to_string())
            .await
    }

    /// Remove a participant on behalf of an operator.
    ///
    /// # Errors
    ///
    /// `Internal` on actor failure.
    pub async fn remove_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), SignalingError> {
        self.remove(room_id, user_id, None, LeaveReason::Kicked)
            .await
    }

    async fn remove(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: Option<&str>,
        reason: LeaveReason,
    ) -> Result<(), SignalingError> {
        let Some(room) = self.registry.get_room(room_id.to_string()).await? else {
            return Ok(());
        };

        let removed = match room
            .leave(
                user_id.to_string(),
                connection_id.map(ToString::to_string),
                reason,
            )
            .await
        {
            Ok(removed) => removed,
            // Room went away, so did the participant
            Err(SignalingError::RoomClosed) => None,
            Err(e) => return Err(e),
        };

        if let Some(removed_connection) = removed {
            self.registry
                .release_connection(removed_connection, room_id.to_string())
                .await?;
        }
        Ok(())
    }

    /// Handle a channel that closed without leaving.
    ///
    /// Unknown or already-released channels are ignored.
    ///
    /// # Errors
    ///
    /// `Internal` on actor failure.
    #[instrument(skip_all, name = "cs.coordinator.disconnect")]
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), SignalingError> {
        let Some(room_id) = self
            .registry
            .lookup_connection(connection_id.to_string())
            .await?
        else {
            debug!(
                target: "cs.coordinator",
                connection_id = %connection_id,
                "Disconnect for unbound channel"
            );
            return Ok(());
        };

        if let Some(room) = self.registry.get_room(room_id.clone()).await? {
            match room.connection_lost(connection_id.to_string()).await {
                Ok(()) | Err(SignalingError::RoomClosed) => {}
                Err(e) => return Err(e),
            }
        }

        self.registry
            .release_connection(connection_id.to_string(), room_id)
            .await
    }

    /// Current snapshot of a room.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` when no live room has this id.
    pub async fn room_state(&self, room_id: &str) -> Result<RoomSnapshot, SignalingError> {
        let room = self.existing_room(room_id).await?;

        room.snapshot().await.map_err(|e| match e {
            SignalingError::RoomClosed => SignalingError::RoomNotFound(room_id.to_string()),
            other => other,
        })
    }

    /// Forward an offer, answer or ICE candidate.
    ///
    /// # Errors
    ///
    /// `InvalidPayload` for empty or oversized payloads, `InvalidTarget`
    /// when sender or target is not active in the room.
    #[instrument(skip_all, name = "cs.coordinator.relay", fields(room_id = %room_id, kind = payload.kind()))]
    pub async fn relay(
        &self,
        room_id: &str,
        from_user_id: &str,
        from_connection_id: &str,
        to_user_id: &str,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        let kind = payload.kind();

        if let Err(e) = payload.validate() {
            prom::record_relay(kind, e.error_type_label());
            return Err(e);
        }

        let Some(room) = self.registry.get_room(room_id.to_string()).await? else {
            prom::record_relay(kind, "invalid_target");
            return Err(SignalingError::InvalidTarget(to_user_id.to_string()));
        };

        room.relay(
            from_user_id.to_string(),
            from_connection_id.to_string(),
            to_user_id.to_string(),
            payload,
        )
        .await
        .map_err(|e| match e {
            SignalingError::RoomClosed => SignalingError::InvalidTarget(to_user_id.to_string()),
            other => other,
        })
    }

    /// Apply a partial media-state update.
    ///
    /// # Errors
    ///
    /// `NotParticipant` unless the caller is active in the room on this channel.
    pub async fn update_media_state(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: &str,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) -> Result<(), SignalingError> {
        let room = self.member_room(room_id).await?;

        room.update_media_state(
            user_id.to_string(),
            connection_id.to_string(),
            audio_enabled,
            video_enabled,
        )
        .await
        .map_err(|e| not_participant_if_closed(e, room_id))
    }

    /// Record the latest network-quality report.
    ///
    /// # Errors
    ///
    /// `NotParticipant` unless the caller is active in the room on this channel.
    pub async fn update_network_quality(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: &str,
        quality: NetworkQuality,
        stats: Option<NetworkStats>,
    ) -> Result<(), SignalingError> {
        let room = self.member_room(room_id).await?;

        room.update_network_quality(
            user_id.to_string(),
            connection_id.to_string(),
            quality,
            stats,
        )
        .await
        .map_err(|e| not_participant_if_closed(e, room_id))
    }

    /// Lock or unlock a room against new joins.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` when no live room has this id.
    pub async fn set_room_locked(&self, room_id: &str, locked: bool) -> Result<(), SignalingError> {
        let room = self.existing_room(room_id).await?;

        room.set_locked(locked).await.map_err(|e| match e {
            SignalingError::RoomClosed => SignalingError::RoomNotFound(room_id.to_string()),
            other => other,
        })
    }

    /// ICE servers for a client.
    ///
    /// # Errors
    ///
    /// `IceUnavailable` when the provider fails.
    pub async fn ice_configuration(
        &self,
        user_id: &str,
    ) -> Result<IceConfiguration, SignalingError> {
        self.ice.ice_configuration(user_id).await
    }

    /// Stop accepting joins and cancel all rooms.
    ///
    /// # Errors
    ///
    /// `Internal` when the registry is already gone.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SignalingError> {
        self.registry.shutdown(deadline).await
    }

    async fn existing_room(&self, room_id: &str) -> Result<RoomHandle, SignalingError> {
        self.registry
            .get_room(room_id.to_string())
            .await?
            .ok_or_else(|| SignalingError::RoomNotFound(room_id.to_string()))
    }

    async fn member_room(&self, room_id: &str) -> Result<RoomHandle, SignalingError> {
        self.registry
            .get_room(room_id.to_string())
            .await?
            .ok_or_else(|| SignalingError::NotParticipant(room_id.to_string()))
    }

    /// Bind the channel to the room, run `op` against it, and undo a new
    /// binding if `op` fails.
    ///
    /// The room is resolved and bound in one registry step, so a room
    /// closing underneath the join only clears its own bindings; the retry
    /// binds the channel to the fresh instance.
    async fn with_binding<F, Fut>(
        &self,
        room_id: &str,
        connection_id: &str,
        op: F,
    ) -> Result<RoomSnapshot, SignalingError>
    where
        F: Fn(RoomHandle) -> Fut,
        Fut: Future<Output = Result<RoomSnapshot, SignalingError>>,
    {
        let (room, mut newly_bound) = self
            .registry
            .bind_room(connection_id.to_string(), room_id.to_string())
            .await?;

        let mut result = op(room).await;

        if matches!(result, Err(SignalingError::RoomClosed)) {
            debug!(
                target: "cs.coordinator",
                room_id = %room_id,
                "Room closed during join, retrying once"
            );
            result = match self
                .registry
                .bind_room(connection_id.to_string(), room_id.to_string())
                .await
            {
                Ok((room, rebound)) => {
                    newly_bound |= rebound;
                    op(room).await
                }
                Err(e) => Err(e),
            };
        }

        if result.is_err() && newly_bound {
            self.registry
                .release_connection(connection_id.to_string(), room_id.to_string())
                .await?;
        }
        result
    }
}

fn not_participant_if_closed(error: SignalingError, room_id: &str) -> SignalingError {
    match error {
        SignalingError::RoomClosed => SignalingError::NotParticipant(room_id.to_string()),
        other => other,
    }
}

fn outcome_label<T>(result: &Result<T, SignalingError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.error_type_label(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ConnectionHandle, RoomSettings};
    use crate::ice::StaticIceConfigProvider;
    use crate::protocol::ServerMessage;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn coordinator(max_participants: usize) -> CallCoordinator {
        let metrics = ActorMetrics::new();
        let settings = RoomSettings {
            default_max_participants: max_participants,
            grace_period: Duration::from_secs(30),
            empty_room_idle: Duration::from_secs(10),
        };
        let registry =
            RoomRegistryHandle::new("cs-test".to_string(), settings, Arc::clone(&metrics));
        let ice = Arc::new(StaticIceConfigProvider::new(
            vec!["stun:stun.example.com".to_string()],
            None,
        ));
        CallCoordinator::new(registry, ice, metrics)
    }

    fn join_request(
        user_id: &str,
        connection_id: &str,
    ) -> (JoinRequest, mpsc::Receiver<ServerMessage>) {
        let (connection, events) =
            ConnectionHandle::new(connection_id, user_id, CancellationToken::new());
        let request = JoinRequest {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            connection,
            audio_enabled: true,
            video_enabled: true,
        };
        (request, events)
    }

    #[tokio::test]
    async fn test_failed_join_releases_new_binding() {
        let coordinator = coordinator(1);
        let (alice, _a) = join_request("alice", "conn-a");
        let (bob, _b) = join_request("bob", "conn-b");

        coordinator.join_call("room-1", alice).await.unwrap();
        let err = coordinator.join_call("room-1", bob).await.unwrap_err();
        assert!(matches!(err, SignalingError::RoomFull { .. }));

        let registry = coordinator.registry();
        assert!(registry
            .lookup_connection("conn-b".to_string())
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            registry
                .lookup_connection("conn-a".to_string())
                .await
                .unwrap()
                .as_deref(),
            Some("room-1")
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_channel_cannot_join_two_rooms() {
        let coordinator = coordinator(8);
        let (first, _a) = join_request("alice", "conn-a");
        let (second, _b) = join_request("alice", "conn-a");

        coordinator.join_call("room-1", first).await.unwrap();
        let err = coordinator.join_call("room-2", second).await.unwrap_err();
        assert!(matches!(err, SignalingError::ConnectionInUse));

        coordinator.registry().cancel();
    }

    #[tokio::test]
    async fn test_disconnect_releases_binding_and_marks_participant() {
        let coordinator = coordinator(8);
        let (alice, _a) = join_request("alice", "conn-a");
        coordinator.join_call("room-1", alice).await.unwrap();

        coordinator.disconnect("conn-a").await.unwrap();
        // Second report is a no-op
        coordinator.disconnect("conn-a").await.unwrap();

        let snapshot = coordinator.room_state("room-1").await.unwrap();
        assert_eq!(
            snapshot.participant("alice").unwrap().status,
            crate::protocol::PresenceStatus::Disconnected
        );
        assert!(coordinator
            .registry()
            .lookup_connection("conn-a".to_string())
            .await
            .unwrap()
            .is_none());

        coordinator.registry().cancel();
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_ok() {
        let coordinator = coordinator(8);
        coordinator
            .leave_call("nowhere", "alice", "conn-a", LeaveReason::Voluntary)
            .await
            .unwrap();
        coordinator.registry().cancel();
    }

    #[tokio::test]
    async fn test_queries_against_unknown_room() {
        let coordinator = coordinator(8);

        assert!(matches!(
            coordinator.room_state("nowhere").await,
            Err(SignalingError::RoomNotFound(_))
        ));
        assert!(matches!(
            coordinator
                .update_media_state("nowhere", "alice", "conn-a", Some(false), None)
                .await,
            Err(SignalingError::NotParticipant(_))
        ));
        assert!(matches!(
            coordinator
                .relay(
                    "nowhere",
                    "alice",
                    "conn-a",
                    "bob",
                    SignalPayload::Offer {
                        sdp: "v=0".to_string()
                    }
                )
                .await,
            Err(SignalingError::InvalidTarget(_))
        ));
        assert!(matches!(
            coordinator.set_room_locked("nowhere", true).await,
            Err(SignalingError::RoomNotFound(_))
        ));

        coordinator.registry().cancel();
    }

    #[tokio::test]
    async fn test_relay_validates_before_lookup() {
        let coordinator = coordinator(8);
        let err = coordinator
            .relay(
                "nowhere",
                "alice",
                "conn-a",
                "bob",
                SignalPayload::Answer { sdp: String::new() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidPayload(_)));

        coordinator.registry().cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_after_idle_close_gets_fresh_room() {
        let coordinator = coordinator(8);
        let (alice, _a) = join_request("alice", "conn-a");
        coordinator.join_call("room-1", alice).await.unwrap();
        coordinator
            .leave_call("room-1", "alice", "conn-a", LeaveReason::Voluntary)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(matches!(
            coordinator.room_state("room-1").await,
            Err(SignalingError::RoomNotFound(_))
        ));

        let (bob, _b) = join_request("bob", "conn-b");
        let snapshot = coordinator.join_call("room-1", bob).await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);
        assert!(snapshot.participant("alice").is_none());

        coordinator.registry().cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_racing_idle_close_keeps_binding() {
        // Land the join at every point of the idle close, from before the
        // timer task runs to after the registry forgot the room.
        for yields in 0..12 {
            let coordinator = coordinator(8);
            let (alice, _a) = join_request("alice", "conn-a");
            coordinator.join_call("room-1", alice).await.unwrap();
            coordinator
                .leave_call("room-1", "alice", "conn-a", LeaveReason::Voluntary)
                .await
                .unwrap();

            tokio::time::advance(Duration::from_secs(10)).await;
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }

            let (bob, _b) = join_request("bob", "conn-b");
            let snapshot = coordinator.join_call("room-1", bob).await.unwrap();
            assert!(snapshot.participant("bob").is_some());

            let registry = coordinator.registry();
            assert_eq!(
                registry
                    .lookup_connection("conn-b".to_string())
                    .await
                    .unwrap()
                    .as_deref(),
                Some("room-1"),
                "binding lost after {yields} yields"
            );

            // The dropped channel must go through the grace flow
            coordinator.disconnect("conn-b").await.unwrap();
            tokio::time::sleep(Duration::from_secs(31)).await;

            let bob_gone = match coordinator.room_state("room-1").await {
                Ok(snapshot) => snapshot.participant("bob").is_none(),
                Err(e) => matches!(e, SignalingError::RoomNotFound(_)),
            };
            assert!(bob_gone, "bob still present after {yields} yields");

            registry.cancel();
        }
    }

    #[tokio::test]
    async fn test_ice_configuration_from_provider() {
        let coordinator = coordinator(8);
        let configuration = coordinator.ice_configuration("alice").await.unwrap();
        assert_eq!(configuration.ice_servers.len(), 1);
        coordinator.registry().cancel();
    }
}
