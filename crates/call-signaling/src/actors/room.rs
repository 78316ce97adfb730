//! `RoomActor` - per-room actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns the participant map, capacity, lock flag and creation time
//! - Applies every participant state transition for its room, one message
//!   at a time, so all mutations of a room are linearized
//! - Emits broadcasts from the same handler that mutated state, so every
//!   member sees events in transition order
//! - Validates and forwards signaling payloads between active participants
//! - Tracks media and network-quality flags and broadcasts diffs
//!
//! # Participant Disconnect Handling
//!
//! When a channel drops:
//! 1. Participant marked disconnected (still visible to others)
//! 2. Grace timer started (duration from configuration)
//! 3. Reconnect before expiry resumes the same entry (same `joined_at`)
//! 4. Otherwise the participant is removed and one `UserLeft` is broadcast
//!
//! # Idle Rooms
//!
//! An empty room schedules an idle timer. If still empty when it fires, the
//! room closes itself, tells the registry, and rejects anything left in its
//! mailbox with `RoomClosed`.

use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::protocol::{
    LeaveReason, NetworkQuality, NetworkStats, ParticipantSnapshot, RoomSnapshot, ServerMessage,
};

use super::connection::ConnectionHandle;
use super::messages::{
    JoinRequest, ReconnectRequest, RegistryMessage, RoomMessage, RoomSettings, SignalPayload,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{GraceTimer, ParticipantState};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
///
/// Every method fails with `RoomClosed` once the actor has stopped.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    instance_id: u64,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Registry-assigned id distinguishing successive rooms with the same id.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SignalingError::RoomClosed)?;

        rx.await.map_err(|_| SignalingError::RoomClosed)
    }

    /// Admit a participant, or resume one that is disconnected.
    pub async fn join(&self, request: JoinRequest) -> Result<RoomSnapshot, SignalingError> {
        self.request(|respond_to| RoomMessage::Join {
            request,
            respond_to,
        })
        .await?
    }

    /// Resume a participant after a dropped channel.
    pub async fn reconnect(
        &self,
        request: ReconnectRequest,
    ) -> Result<RoomSnapshot, SignalingError> {
        self.request(|respond_to| RoomMessage::Reconnect {
            request,
            respond_to,
        })
        .await?
    }

    /// Remove a participant now. Idempotent.
    ///
    /// Returns the removed participant's channel id, if anyone was removed.
    pub async fn leave(
        &self,
        user_id: String,
        connection_id: Option<String>,
        reason: LeaveReason,
    ) -> Result<Option<String>, SignalingError> {
        self.request(|respond_to| RoomMessage::Leave {
            user_id,
            connection_id,
            reason,
            respond_to,
        })
        .await?
    }

    /// Report that a channel closed without an explicit leave.
    pub async fn connection_lost(&self, connection_id: String) -> Result<(), SignalingError> {
        self.sender
            .send(RoomMessage::ConnectionLost { connection_id })
            .await
            .map_err(|_| SignalingError::RoomClosed)
    }

    /// Forward an offer, answer or ICE candidate.
    pub async fn relay(
        &self,
        from_user_id: String,
        from_connection_id: String,
        to_user_id: String,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::Relay {
            from_user_id,
            from_connection_id,
            to_user_id,
            payload,
            respond_to,
        })
        .await?
    }

    pub async fn update_media_state(
        &self,
        user_id: String,
        connection_id: String,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::UpdateMediaState {
            user_id,
            connection_id,
            audio_enabled,
            video_enabled,
            respond_to,
        })
        .await?
    }

    pub async fn update_network_quality(
        &self,
        user_id: String,
        connection_id: String,
        quality: NetworkQuality,
        stats: Option<NetworkStats>,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::UpdateNetworkQuality {
            user_id,
            connection_id,
            quality,
            stats,
            respond_to,
        })
        .await?
    }

    /// Lock or unlock the room against new joins.
    pub async fn set_locked(&self, locked: bool) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::SetLocked { locked, respond_to })
            .await?
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, SignalingError> {
        self.request(|respond_to| RoomMessage::GetSnapshot { respond_to })
            .await
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor has stopped taking messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Participant state within a room.
#[derive(Debug)]
struct Participant {
    user_id: String,
    display_name: String,
    /// Current channel; replaced on reconnect.
    connection: ConnectionHandle,
    audio_enabled: bool,
    video_enabled: bool,
    network_quality: NetworkQuality,
    state: ParticipantState,
    /// First admission, kept across reconnects.
    joined_at: DateTime<Utc>,
}

impl Participant {
    fn to_snapshot(&self) -> Option<ParticipantSnapshot> {
        let status = self.state.status()?;
        Some(ParticipantSnapshot {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            network_quality: self.network_quality,
            status,
            joined_at: self.joined_at,
        })
    }

    /// Active and speaking through `connection_id`.
    fn is_current(&self, connection_id: &str) -> bool {
        self.state.is_active() && self.connection.connection_id() == connection_id
    }
}

/// Pending idle-close timer.
struct IdleTimer {
    epoch: u64,
    cancel: CancellationToken,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance_id: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Used by timer tasks to post back into this mailbox.
    self_sender: mpsc::WeakSender<RoomMessage>,
    /// Told when this room closes itself.
    registry: Option<mpsc::WeakSender<RegistryMessage>>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    participants: HashMap<String, Participant>,
    max_participants: usize,
    locked: bool,
    created_at: DateTime<Utc>,
    settings: RoomSettings,
    /// Source of grace and idle timer epochs.
    next_epoch: u64,
    idle_timer: Option<IdleTimer>,
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle. The room starts empty with
    /// its idle timer running.
    pub fn spawn(
        room_id: String,
        instance_id: u64,
        max_participants: usize,
        settings: RoomSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        registry: Option<mpsc::WeakSender<RegistryMessage>>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let mut actor = Self {
            room_id: room_id.clone(),
            instance_id,
            receiver,
            self_sender: sender.downgrade(),
            registry,
            cancel_token: cancel_token.clone(),
            participants: HashMap::new(),
            max_participants: max_participants.max(1),
            locked: false,
            created_at: Utc::now(),
            settings,
            next_epoch: 0,
            idle_timer: None,
            closed: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };
        actor.schedule_idle();

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
            instance_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cs.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            instance_id = self.instance_id,
            max_participants = self.max_participants,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cs.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if self.closed {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "cs.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Anything still queued raced with closure
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            Self::reject(message);
        }

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(request);
                let _ = respond_to.send(result);
            }

            RoomMessage::Reconnect {
                request,
                respond_to,
            } => {
                let result = self.handle_reconnect(request);
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                user_id,
                connection_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_leave(&user_id, connection_id.as_deref(), reason);
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectionLost { connection_id } => {
                self.handle_connection_lost(&connection_id);
            }

            RoomMessage::Relay {
                from_user_id,
                from_connection_id,
                to_user_id,
                payload,
                respond_to,
            } => {
                let result =
                    self.handle_relay(from_user_id, &from_connection_id, &to_user_id, payload);
                let _ = respond_to.send(result);
            }

            RoomMessage::UpdateMediaState {
                user_id,
                connection_id,
                audio_enabled,
                video_enabled,
                respond_to,
            } => {
                let result =
                    self.handle_media_state(&user_id, &connection_id, audio_enabled, video_enabled);
                let _ = respond_to.send(result);
            }

            RoomMessage::UpdateNetworkQuality {
                user_id,
                connection_id,
                quality,
                stats,
                respond_to,
            } => {
                let result = self.handle_network_quality(&user_id, &connection_id, quality, stats);
                let _ = respond_to.send(result);
            }

            RoomMessage::SetLocked { locked, respond_to } => {
                self.locked = locked;
                info!(
                    target: "cs.actor.room",
                    room_id = %self.room_id,
                    locked = locked,
                    "Room lock changed"
                );
                let _ = respond_to.send(Ok(()));
            }

            RoomMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::GraceExpired { user_id, epoch } => {
                self.handle_grace_expired(&user_id, epoch);
            }

            RoomMessage::IdleExpired { epoch } => {
                self.handle_idle_expired(epoch);
            }
        }
    }

    /// Reply `RoomClosed` to a message that arrived after closure.
    fn reject(message: RoomMessage) {
        match message {
            RoomMessage::Join { respond_to, .. } | RoomMessage::Reconnect { respond_to, .. } => {
                let _ = respond_to.send(Err(SignalingError::RoomClosed));
            }
            RoomMessage::Leave { respond_to, .. } => {
                let _ = respond_to.send(Err(SignalingError::RoomClosed));
            }
            RoomMessage::Relay { respond_to, .. }
            | RoomMessage::UpdateMediaState { respond_to, .. }
            | RoomMessage::UpdateNetworkQuality { respond_to, .. }
            | RoomMessage::SetLocked { respond_to, .. } => {
                let _ = respond_to.send(Err(SignalingError::RoomClosed));
            }
            // Dropping the sender surfaces as RoomClosed in the handle
            RoomMessage::GetSnapshot { .. }
            | RoomMessage::ConnectionLost { .. }
            | RoomMessage::GraceExpired { .. }
            | RoomMessage::IdleExpired { .. } => {}
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    fn handle_join(&mut self, request: JoinRequest) -> Result<RoomSnapshot, SignalingError> {
        if let Some(existing) = self.participants.get(&request.user_id) {
            if existing.state.is_disconnected() {
                return self.resume(&request.user_id, request.connection);
            }

            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                state = existing.state.name(),
                "Join rejected: user already has a session"
            );
            return Err(SignalingError::DuplicateSession);
        }

        if self.locked {
            return Err(SignalingError::RoomLocked);
        }

        if self.participants.len() >= self.max_participants {
            return Err(SignalingError::RoomFull {
                max_participants: self.max_participants,
            });
        }

        let mut participant = Participant {
            user_id: request.user_id.clone(),
            display_name: request.display_name,
            connection: request.connection,
            audio_enabled: request.audio_enabled,
            video_enabled: request.video_enabled,
            network_quality: NetworkQuality::Good,
            state: ParticipantState::Joining,
            joined_at: Utc::now(),
        };
        participant
            .state
            .activate()
            .map_err(|e| SignalingError::Internal(e.to_string()))?;

        let joined = participant.to_snapshot();
        self.participants
            .insert(request.user_id.clone(), participant);
        self.cancel_idle_timer();
        self.metrics.participant_added();

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            max_participants = self.max_participants,
            "Participant joined"
        );

        if let Some(participant) = joined {
            self.broadcast(
                &request.user_id,
                &ServerMessage::UserJoined {
                    room_id: self.room_id.clone(),
                    participant,
                },
            );
        }

        Ok(self.snapshot())
    }

    fn handle_reconnect(
        &mut self,
        request: ReconnectRequest,
    ) -> Result<RoomSnapshot, SignalingError> {
        let user_id = request.join.user_id.clone();

        let Some(existing) = self.participants.get(&user_id) else {
            // Grace already expired
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                "Reconnect for absent participant, treating as fresh join"
            );
            return self.handle_join(request.join);
        };

        if existing.state.is_disconnected() {
            return self.resume(&user_id, request.join.connection);
        }

        if existing.is_current(request.join.connection.connection_id()) {
            // Already live on this very channel
            return Err(SignalingError::DuplicateSession);
        }

        if existing.is_current(&request.previous_connection_id) {
            // Client saw the drop before the server did
            return self.take_over(&user_id, request.join.connection);
        }

        Err(SignalingError::DuplicateSession)
    }

    /// `Disconnected -> Active` on a new channel.
    fn resume(
        &mut self,
        user_id: &str,
        connection: ConnectionHandle,
    ) -> Result<RoomSnapshot, SignalingError> {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return Err(SignalingError::Internal(
                "resume of absent participant".to_string(),
            ));
        };

        let downtime = participant
            .state
            .disconnected_since()
            .map(|since| since.elapsed());
        let timer = participant
            .state
            .reconnect()
            .map_err(|e| SignalingError::Internal(e.to_string()))?;
        timer.cancel();

        participant.connection = connection;
        participant.network_quality = NetworkQuality::Good;
        prom::record_reconnect();

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            downtime_ms = downtime.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            "Participant reconnected"
        );

        self.broadcast(
            user_id,
            &ServerMessage::UserReconnected {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                network_quality: NetworkQuality::Good,
            },
        );

        Ok(self.snapshot())
    }

    /// `Active -> Disconnected -> Active` in one step, closing the old channel.
    fn take_over(
        &mut self,
        user_id: &str,
        connection: ConnectionHandle,
    ) -> Result<RoomSnapshot, SignalingError> {
        let epoch = self.next_epoch();
        let Some(participant) = self.participants.get_mut(user_id) else {
            return Err(SignalingError::Internal(
                "takeover of absent participant".to_string(),
            ));
        };

        // Never scheduled; resume cancels it immediately
        let timer = GraceTimer::child_of(epoch, &self.cancel_token);
        participant
            .state
            .disconnect(timer)
            .map_err(|e| SignalingError::Internal(e.to_string()))?;
        let previous = participant.connection.clone();

        self.broadcast(
            user_id,
            &ServerMessage::UserDisconnected {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
            },
        );
        previous.close();

        self.resume(user_id, connection)
    }

    fn handle_leave(
        &mut self,
        user_id: &str,
        caller_connection_id: Option<&str>,
        reason: LeaveReason,
    ) -> Result<Option<String>, SignalingError> {
        let Some(mut participant) = self.participants.remove(user_id) else {
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                "Leave for absent participant, nothing to do"
            );
            return Ok(None);
        };

        let was_active = participant.state.is_active();
        match participant.state.remove() {
            Ok(Some(timer)) => timer.cancel(),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "cs.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Unexpected state on leave"
                );
            }
        }
        self.metrics.participant_removed();

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            reason = reason.as_str(),
            participants = self.participants.len(),
            "Participant left"
        );

        let left = ServerMessage::UserLeft {
            room_id: self.room_id.clone(),
            user_id: user_id.to_string(),
            reason,
        };

        // The removed session learns about it when someone else ended it
        let removed_connection = participant.connection.connection_id().to_string();
        if was_active && caller_connection_id != Some(removed_connection.as_str()) {
            participant.connection.deliver(left.clone());
        }

        self.broadcast(user_id, &left);
        self.schedule_idle_if_empty();

        Ok(Some(removed_connection))
    }

    fn handle_connection_lost(&mut self, connection_id: &str) {
        let owner = self
            .participants
            .values()
            .find(|p| p.is_current(connection_id))
            .map(|p| p.user_id.clone());

        let Some(user_id) = owner else {
            // Already left, already disconnected, or superseded by a reconnect
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                connection_id = %connection_id,
                "Stale connection loss ignored"
            );
            return;
        };

        let epoch = self.next_epoch();
        let timer = GraceTimer::child_of(epoch, &self.cancel_token);
        let Some(participant) = self.participants.get_mut(&user_id) else {
            return;
        };
        if let Err(e) = participant.state.disconnect(timer.clone()) {
            warn!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                error = %e,
                "Disconnect rejected"
            );
            return;
        }
        participant.network_quality = NetworkQuality::Disconnected;

        self.spawn_grace_timer(user_id.clone(), &timer);

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            grace_period_secs = self.settings.grace_period.as_secs(),
            "Participant disconnected, grace period started"
        );

        self.broadcast(
            &user_id,
            &ServerMessage::UserDisconnected {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
            },
        );
    }

    fn handle_grace_expired(&mut self, user_id: &str, epoch: u64) {
        let Some(participant) = self.participants.get_mut(user_id) else {
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                epoch = epoch,
                "Grace expiry for absent participant ignored"
            );
            return;
        };

        if let Err(e) = participant.state.expire(epoch) {
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                epoch = epoch,
                error = %e,
                "Stale grace expiry ignored"
            );
            return;
        }

        self.participants.remove(user_id);
        self.metrics.participant_removed();
        prom::record_grace_expired();

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            "Participant removed after grace period"
        );

        self.broadcast(
            user_id,
            &ServerMessage::UserLeft {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                reason: LeaveReason::Timeout,
            },
        );
        self.schedule_idle_if_empty();
    }

    // ------------------------------------------------------------------
    // Relay and presence
    // ------------------------------------------------------------------

    fn handle_relay(
        &mut self,
        from_user_id: String,
        from_connection_id: &str,
        to_user_id: &str,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        let kind = payload.kind();

        let outcome = self.check_relay(&from_user_id, from_connection_id, to_user_id);
        if let Err(e) = outcome {
            prom::record_relay(kind, e.error_type_label());
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                kind = kind,
                error = %e,
                "Relay rejected"
            );
            return Err(e);
        }

        let message = payload.into_message(self.room_id.clone(), from_user_id);
        let delivered = self
            .participants
            .get(to_user_id)
            .is_some_and(|target| target.connection.deliver(message));

        prom::record_relay(kind, if delivered { "success" } else { "dropped" });
        Ok(())
    }

    fn check_relay(
        &self,
        from_user_id: &str,
        from_connection_id: &str,
        to_user_id: &str,
    ) -> Result<(), SignalingError> {
        if from_user_id == to_user_id {
            return Err(SignalingError::InvalidTarget(
                "cannot address yourself".to_string(),
            ));
        }

        let sender_active = self
            .participants
            .get(from_user_id)
            .is_some_and(|p| p.is_current(from_connection_id));
        if !sender_active {
            return Err(SignalingError::InvalidTarget(
                "sender is not active in room".to_string(),
            ));
        }

        let target_active = self
            .participants
            .get(to_user_id)
            .is_some_and(|p| p.state.is_active());
        if !target_active {
            return Err(SignalingError::InvalidTarget(to_user_id.to_string()));
        }

        Ok(())
    }

    fn handle_media_state(
        &mut self,
        user_id: &str,
        connection_id: &str,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
    ) -> Result<(), SignalingError> {
        let Some(participant) = self
            .participants
            .get_mut(user_id)
            .filter(|p| p.is_current(connection_id))
        else {
            return Err(SignalingError::NotParticipant(self.room_id.clone()));
        };

        let audio_changed = audio_enabled.filter(|a| *a != participant.audio_enabled);
        let video_changed = video_enabled.filter(|v| *v != participant.video_enabled);
        if let Some(audio) = audio_changed {
            participant.audio_enabled = audio;
        }
        if let Some(video) = video_changed {
            participant.video_enabled = video;
        }

        if audio_changed.is_none() && video_changed.is_none() {
            return Ok(());
        }

        self.broadcast(
            user_id,
            &ServerMessage::MediaStateChanged {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                audio_enabled: audio_changed,
                video_enabled: video_changed,
            },
        );
        Ok(())
    }

    fn handle_network_quality(
        &mut self,
        user_id: &str,
        connection_id: &str,
        quality: NetworkQuality,
        stats: Option<NetworkStats>,
    ) -> Result<(), SignalingError> {
        let Some(participant) = self
            .participants
            .get_mut(user_id)
            .filter(|p| p.is_current(connection_id))
        else {
            return Err(SignalingError::NotParticipant(self.room_id.clone()));
        };

        participant.network_quality = quality;

        self.broadcast(
            user_id,
            &ServerMessage::NetworkQualityChanged {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                quality,
                stats,
            },
        );
        Ok(())
    }

    /// Deliver to every active participant except `except_user_id`.
    fn broadcast(&self, except_user_id: &str, message: &ServerMessage) {
        for participant in self.participants.values() {
            if participant.user_id != except_user_id && participant.state.is_active() {
                participant.connection.deliver(message.clone());
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<ParticipantSnapshot> = self
            .participants
            .values()
            .filter_map(Participant::to_snapshot)
            .collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        RoomSnapshot {
            room_id: self.room_id.clone(),
            max_participants: self.max_participants,
            locked: self.locked,
            created_at: self.created_at,
            participants,
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn spawn_grace_timer(&self, user_id: String, timer: &GraceTimer) {
        let mailbox = self.self_sender.clone();
        let token = timer.token();
        let epoch = timer.epoch();
        let grace_period = self.settings.grace_period;

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(grace_period) => {
                    if let Some(sender) = mailbox.upgrade() {
                        let _ = sender.send(RoomMessage::GraceExpired { user_id, epoch }).await;
                    }
                }
            }
        });
    }

    fn schedule_idle_if_empty(&mut self) {
        if self.participants.is_empty() {
            self.schedule_idle();
        }
    }

    fn schedule_idle(&mut self) {
        self.cancel_idle_timer();

        let epoch = self.next_epoch();
        let cancel = self.cancel_token.child_token();
        let token = cancel.clone();
        let mailbox = self.self_sender.clone();
        let idle = self.settings.empty_room_idle;

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(idle) => {
                    if let Some(sender) = mailbox.upgrade() {
                        let _ = sender.send(RoomMessage::IdleExpired { epoch }).await;
                    }
                }
            }
        });

        self.idle_timer = Some(IdleTimer { epoch, cancel });
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel.cancel();
        }
    }

    fn handle_idle_expired(&mut self, epoch: u64) {
        let current = self.idle_timer.as_ref().is_some_and(|t| t.epoch == epoch);
        if !current || !self.participants.is_empty() {
            debug!(
                target: "cs.actor.room",
                room_id = %self.room_id,
                epoch = epoch,
                "Stale idle expiry ignored"
            );
            return;
        }

        self.idle_timer = None;
        self.closed = true;

        info!(
            target: "cs.actor.room",
            room_id = %self.room_id,
            "Room idle, closing"
        );

        // The registry also notices via the finished task if this is lost
        if let Some(registry) = self.registry.as_ref().and_then(mpsc::WeakSender::upgrade) {
            if let Err(e) = registry.try_send(RegistryMessage::RoomClosed {
                room_id: self.room_id.clone(),
                instance_id: self.instance_id,
            }) {
                debug!(
                    target: "cs.actor.room",
                    room_id = %self.room_id,
                    error = %e,
                    "Could not notify registry of closure"
                );
            }
        }
    }

    /// Stop all timers and release participant counts.
    fn graceful_shutdown(&mut self) {
        self.cancel_idle_timer();

        for (_, mut participant) in self.participants.drain() {
            if let Ok(Some(timer)) = participant.state.remove() {
                timer.cancel();
            }
            self.metrics.participant_removed();
        }

        self.closed = true;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;
    use std::time::Duration;

    const TEST_GRACE: Duration = Duration::from_secs(30);
    const IDLE: Duration = Duration::from_secs(10);

    fn settings() -> RoomSettings {
        RoomSettings {
            default_max_participants: 8,
            grace_period: TEST_GRACE,
            empty_room_idle: IDLE,
        }
    }

    fn spawn_room(max: usize) -> (RoomHandle, JoinHandle<()>) {
        RoomActor::spawn(
            "room-1".to_string(),
            1,
            max,
            settings(),
            CancellationToken::new(),
            ActorMetrics::new(),
            None,
        )
    }

    struct Client {
        connection: ConnectionHandle,
        events: mpsc::Receiver<ServerMessage>,
    }

    impl Client {
        fn new(user_id: &str, connection_id: &str) -> Self {
            let (connection, events) =
                ConnectionHandle::new(connection_id, user_id, CancellationToken::new());
            Self { connection, events }
        }

        fn join_request(&self) -> JoinRequest {
            JoinRequest {
                user_id: self.connection.user_id().to_string(),
                display_name: self.connection.user_id().to_uppercase(),
                connection: self.connection.clone(),
                audio_enabled: true,
                video_enabled: true,
            }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.events.try_recv() {
                out.push(message);
            }
            out
        }
    }

    #[tokio::test]
    async fn test_join_returns_snapshot_and_notifies_others() {
        let (room, _task) = spawn_room(8);
        let mut alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        let snapshot = room.join(alice.join_request()).await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);

        let snapshot = room.join(bob.join_request()).await.unwrap();
        assert_eq!(snapshot.participants.len(), 2);

        let events = alice.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.first(),
            Some(ServerMessage::UserJoined { participant, .. }) if participant.user_id == "bob"
        ));
        assert!(bob.drain().is_empty(), "joiner does not receive its own join");
    }

    #[tokio::test]
    async fn test_capacity_and_lock() {
        let (room, _task) = spawn_room(2);
        let alice = Client::new("alice", "conn-a");
        let bob = Client::new("bob", "conn-b");
        let carol = Client::new("carol", "conn-c");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();

        let err = room.join(carol.join_request()).await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::RoomFull {
                max_participants: 2
            }
        ));

        room.leave("bob".to_string(), Some("conn-b".to_string()), LeaveReason::Voluntary)
            .await
            .unwrap();
        room.set_locked(true).await.unwrap();

        let err = room.join(carol.join_request()).await.unwrap_err();
        assert!(matches!(err, SignalingError::RoomLocked));
        assert!(room.snapshot().await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_duplicate_join_leaves_original_intact() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let alice_second_tab = Client::new("alice", "conn-a2");

        room.join(alice.join_request()).await.unwrap();
        let err = room.join(alice_second_tab.join_request()).await.unwrap_err();
        assert!(matches!(err, SignalingError::DuplicateSession));

        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(snapshot.participants.len(), 1);
        assert!(!alice.connection.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_reconnect_within_grace() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();
        let joined_at = room
            .snapshot()
            .await
            .unwrap()
            .participant("alice")
            .unwrap()
            .joined_at;

        room.connection_lost("conn-a".to_string()).await.unwrap();
        let snapshot = room.snapshot().await.unwrap();
        let entry = snapshot.participant("alice").unwrap();
        assert_eq!(entry.status, PresenceStatus::Disconnected);
        assert_eq!(entry.network_quality, NetworkQuality::Disconnected);

        tokio::time::sleep(Duration::from_secs(5)).await;

        let alice_again = Client::new("alice", "conn-a-new");
        let snapshot = room
            .reconnect(ReconnectRequest {
                join: alice_again.join_request(),
                previous_connection_id: "conn-a".to_string(),
            })
            .await
            .unwrap();
        let entry = snapshot.participant("alice").unwrap();
        assert_eq!(entry.status, PresenceStatus::Active);
        assert_eq!(entry.joined_at, joined_at);
        assert_eq!(snapshot.participants.len(), 2);

        // Past the original deadline nothing else happens
        tokio::time::sleep(TEST_GRACE).await;
        room.snapshot().await.unwrap();

        let events = bob.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events.first(), Some(ServerMessage::UserDisconnected { user_id, .. }) if user_id == "alice"));
        assert!(matches!(
            events.get(1),
            Some(ServerMessage::UserReconnected { user_id, network_quality, .. })
                if user_id == "alice" && *network_quality == NetworkQuality::Good
        ));

        // Peers and late snapshots agree on the reset quality
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(
            snapshot.participant("alice").unwrap().network_quality,
            NetworkQuality::Good
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_emits_single_user_left() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();
        room.connection_lost("conn-a".to_string()).await.unwrap();
        // Duplicate loss report is a no-op
        room.connection_lost("conn-a".to_string()).await.unwrap();

        tokio::time::sleep(TEST_GRACE + Duration::from_secs(1)).await;
        let snapshot = room.snapshot().await.unwrap();
        assert!(snapshot.participant("alice").is_none());

        let left: Vec<_> = bob
            .drain()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::UserLeft { .. }))
            .collect();
        assert_eq!(
            left,
            vec![ServerMessage::UserLeft {
                room_id: "room-1".to_string(),
                user_id: "alice".to_string(),
                reason: LeaveReason::Timeout,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_leave_wins_over_pending_grace() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();
        room.connection_lost("conn-a".to_string()).await.unwrap();
        room.leave("alice".to_string(), None, LeaveReason::Voluntary)
            .await
            .unwrap();

        tokio::time::sleep(TEST_GRACE + Duration::from_secs(1)).await;
        room.snapshot().await.unwrap();

        let left: Vec<_> = bob
            .drain()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::UserLeft { .. }))
            .collect();
        assert_eq!(left.len(), 1);
        assert!(matches!(
            left.first(),
            Some(ServerMessage::UserLeft {
                reason: LeaveReason::Voluntary,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let _bob_keeps_room_open = {
            let bob = Client::new("bob", "conn-b");
            room.join(bob.join_request()).await.unwrap();
            bob
        };

        room.join(alice.join_request()).await.unwrap();
        let removed = room
            .leave("alice".to_string(), Some("conn-a".to_string()), LeaveReason::Voluntary)
            .await
            .unwrap();
        assert_eq!(removed.as_deref(), Some("conn-a"));

        let removed = room
            .leave("alice".to_string(), Some("conn-a".to_string()), LeaveReason::Voluntary)
            .await
            .unwrap();
        assert!(removed.is_none());

        // Late loss report for the departed channel is a no-op
        room.connection_lost("conn-a".to_string()).await.unwrap();
        assert_eq!(room.snapshot().await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_from_other_channel_notifies_removed_session() {
        let (room, _task) = spawn_room(8);
        let mut alice = Client::new("alice", "conn-a");

        room.join(alice.join_request()).await.unwrap();
        room.leave("alice".to_string(), Some("conn-a2".to_string()), LeaveReason::Voluntary)
            .await
            .unwrap();

        let events = alice.drain();
        assert!(matches!(events.first(), Some(ServerMessage::UserLeft { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_takeover_of_active_session() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();

        let alice_new = Client::new("alice", "conn-a-new");
        room.reconnect(ReconnectRequest {
            join: alice_new.join_request(),
            previous_connection_id: "conn-a".to_string(),
        })
        .await
        .unwrap();

        assert!(alice.connection.is_closed(), "old channel is closed");
        let events = bob.drain();
        assert!(matches!(events.first(), Some(ServerMessage::UserDisconnected { .. })));
        assert!(matches!(events.get(1), Some(ServerMessage::UserReconnected { .. })));

        // The old channel's late loss report no longer matches
        room.connection_lost("conn-a".to_string()).await.unwrap();
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(
            snapshot.participant("alice").unwrap().status,
            PresenceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_reconnect_on_own_live_channel_is_duplicate() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");

        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();
        bob.drain();

        let err = room
            .reconnect(ReconnectRequest {
                join: alice.join_request(),
                previous_connection_id: "conn-a".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::DuplicateSession));

        assert!(!alice.connection.is_closed(), "live channel stays open");
        assert!(bob.drain().is_empty(), "no presence churn for peers");
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(
            snapshot.participant("alice").unwrap().status,
            PresenceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_reconnect_with_wrong_previous_connection_is_duplicate() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        room.join(alice.join_request()).await.unwrap();

        let intruder = Client::new("alice", "conn-x");
        let err = room
            .reconnect(ReconnectRequest {
                join: intruder.join_request(),
                previous_connection_id: "conn-unknown".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::DuplicateSession));
    }

    #[tokio::test]
    async fn test_reconnect_after_removal_is_fresh_join() {
        let (room, _task) = spawn_room(8);
        let mut bob = Client::new("bob", "conn-b");
        room.join(bob.join_request()).await.unwrap();

        let alice = Client::new("alice", "conn-a");
        room.reconnect(ReconnectRequest {
            join: alice.join_request(),
            previous_connection_id: "conn-old".to_string(),
        })
        .await
        .unwrap();

        assert!(matches!(
            bob.drain().first(),
            Some(ServerMessage::UserJoined { .. })
        ));
    }

    #[tokio::test]
    async fn test_relay_delivers_with_server_side_sender() {
        let (room, _task) = spawn_room(8);
        let mut alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");
        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();
        alice.drain();

        room.relay(
            "alice".to_string(),
            "conn-a".to_string(),
            "bob".to_string(),
            SignalPayload::Offer {
                sdp: "v=0 offer".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            bob.drain(),
            vec![ServerMessage::ReceiveOffer {
                room_id: "room-1".to_string(),
                from_user_id: "alice".to_string(),
                sdp: "v=0 offer".to_string(),
            }]
        );
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_relay_rejects_invalid_targets() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");
        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();

        let offer = || SignalPayload::Offer {
            sdp: "v=0".to_string(),
        };

        let err = room
            .relay("alice".into(), "conn-a".into(), "alice".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidTarget(_)));

        let err = room
            .relay("alice".into(), "conn-a".into(), "nobody".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidTarget(_)));

        // Stale channel of the sender
        let err = room
            .relay("alice".into(), "conn-old".into(), "bob".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidTarget(_)));

        // Disconnected target
        room.connection_lost("conn-b".to_string()).await.unwrap();
        let err = room
            .relay("alice".into(), "conn-a".into(), "bob".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::InvalidTarget(_)));

        assert!(!bob
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::ReceiveOffer { .. })));
    }

    #[tokio::test]
    async fn test_media_state_broadcasts_only_changes() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");
        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();

        // Unchanged values broadcast nothing
        room.update_media_state("alice".into(), "conn-a".into(), Some(true), Some(true))
            .await
            .unwrap();
        assert!(bob.drain().is_empty());

        room.update_media_state("alice".into(), "conn-a".into(), Some(false), Some(true))
            .await
            .unwrap();
        assert_eq!(
            bob.drain(),
            vec![ServerMessage::MediaStateChanged {
                room_id: "room-1".to_string(),
                user_id: "alice".to_string(),
                audio_enabled: Some(false),
                video_enabled: None,
            }]
        );

        let snapshot = room.snapshot().await.unwrap();
        let entry = snapshot.participant("alice").unwrap();
        assert!(!entry.audio_enabled);
        assert!(entry.video_enabled);
    }

    #[tokio::test]
    async fn test_network_quality_overwrites_and_broadcasts() {
        let (room, _task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        let mut bob = Client::new("bob", "conn-b");
        room.join(alice.join_request()).await.unwrap();
        room.join(bob.join_request()).await.unwrap();

        room.update_network_quality("alice".into(), "conn-a".into(), NetworkQuality::Poor, None)
            .await
            .unwrap();
        room.update_network_quality("alice".into(), "conn-a".into(), NetworkQuality::Poor, None)
            .await
            .unwrap();

        assert_eq!(bob.drain().len(), 2);
        let snapshot = room.snapshot().await.unwrap();
        assert_eq!(
            snapshot.participant("alice").unwrap().network_quality,
            NetworkQuality::Poor
        );

        let err = room
            .update_network_quality("carol".into(), "conn-c".into(), NetworkQuality::Good, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::NotParticipant(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_closes_after_idle_window() {
        let (room, task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");

        room.join(alice.join_request()).await.unwrap();
        room.leave("alice".to_string(), None, LeaveReason::Voluntary)
            .await
            .unwrap();

        // Rejoin inside the window keeps the room
        tokio::time::sleep(IDLE / 2).await;
        room.join(alice.join_request()).await.unwrap();
        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(room.snapshot().await.unwrap().participants.len(), 1);

        room.leave("alice".to_string(), None, LeaveReason::Voluntary)
            .await
            .unwrap();
        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;

        task.await.unwrap();
        assert!(room.is_closed());
        let err = room.join(alice.join_request()).await.unwrap_err();
        assert!(matches!(err, SignalingError::RoomClosed));
    }

    #[tokio::test]
    async fn test_cancel_stops_actor() {
        let (room, task) = spawn_room(8);
        let alice = Client::new("alice", "conn-a");
        room.join(alice.join_request()).await.unwrap();

        room.cancel();
        task.await.unwrap();

        assert!(room.is_cancelled());
        assert!(matches!(
            room.snapshot().await,
            Err(SignalingError::RoomClosed)
        ));
    }
}
