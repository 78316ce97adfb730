//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::errors::SignalingError;
use crate::protocol::{
    LeaveReason, NetworkQuality, NetworkStats, RoomSnapshot, ServerMessage,
    MAX_SIGNALING_PAYLOAD_BYTES,
};

use super::connection::ConnectionHandle;
use super::room::RoomHandle;

use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Find a room, creating it with `max_participants` if absent.
    GetOrCreateRoom {
        room_id: String,
        max_participants: Option<usize>,
        respond_to: oneshot::Sender<Result<RoomHandle, SignalingError>>,
    },

    /// Find an existing room.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    /// A room actor closed itself after its idle window.
    RoomClosed { room_id: String, instance_id: u64 },

    /// Resolve (or create) a room and bind a channel to that room instance.
    /// Replies with the room and whether the binding is new.
    BindRoom {
        connection_id: String,
        room_id: String,
        respond_to: oneshot::Sender<Result<(RoomHandle, bool), SignalingError>>,
    },

    /// Drop a channel's binding if it still points at `room_id`.
    ReleaseConnection {
        connection_id: String,
        room_id: String,
    },

    /// Room a channel is bound to.
    LookupConnection {
        connection_id: String,
        respond_to: oneshot::Sender<Option<String>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and cancel everything (SIGTERM).
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Fresh join, or resume of a disconnected participant.
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<RoomSnapshot, SignalingError>>,
    },

    /// Reconnect after a dropped channel.
    Reconnect {
        request: ReconnectRequest,
        respond_to: oneshot::Sender<Result<RoomSnapshot, SignalingError>>,
    },

    /// Remove a participant immediately, whichever channel they are on.
    ///
    /// `connection_id` is the requesting channel (`None` for administrative
    /// removal). Replies with the removed participant's channel id.
    Leave {
        user_id: String,
        connection_id: Option<String>,
        reason: LeaveReason,
        respond_to: oneshot::Sender<Result<Option<String>, SignalingError>>,
    },

    /// A channel closed without an explicit leave.
    ConnectionLost { connection_id: String },

    /// Forward a negotiation payload from one participant to another.
    Relay {
        from_user_id: String,
        from_connection_id: String,
        to_user_id: String,
        payload: SignalPayload,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    UpdateMediaState {
        user_id: String,
        connection_id: String,
        audio_enabled: Option<bool>,
        video_enabled: Option<bool>,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    UpdateNetworkQuality {
        user_id: String,
        connection_id: String,
        quality: NetworkQuality,
        stats: Option<NetworkStats>,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    SetLocked {
        locked: bool,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    GetSnapshot {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },

    /// Posted by a grace timer task.
    GraceExpired { user_id: String, epoch: u64 },

    /// Posted by the idle timer task.
    IdleExpired { epoch: u64 },
}

/// Admission request for a room.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub user_id: String,
    pub display_name: String,
    /// Channel that will receive the participant's events.
    pub connection: ConnectionHandle,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Reconnect request; media flags are only applied on a fresh join.
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    pub join: JoinRequest,
    pub previous_connection_id: String,
}

/// Negotiation payload. Opaque to the service beyond size checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

impl SignalPayload {
    /// Bounded label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Reject empty or oversized payloads.
    ///
    /// # Errors
    ///
    /// `InvalidPayload` describing the violation.
    pub fn validate(&self) -> Result<(), SignalingError> {
        let (field, body) = match self {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => ("sdp", sdp),
            SignalPayload::IceCandidate { candidate, .. } => ("candidate", candidate),
        };

        if body.trim().is_empty() {
            return Err(SignalingError::InvalidPayload(format!("{field} is empty")));
        }
        if body.len() > MAX_SIGNALING_PAYLOAD_BYTES {
            return Err(SignalingError::InvalidPayload(format!(
                "{field} exceeds {MAX_SIGNALING_PAYLOAD_BYTES} bytes"
            )));
        }
        Ok(())
    }

    /// Build the frame delivered to the target.
    #[must_use]
    pub fn into_message(self, room_id: String, from_user_id: String) -> ServerMessage {
        match self {
            SignalPayload::Offer { sdp } => ServerMessage::ReceiveOffer {
                room_id,
                from_user_id,
                sdp,
            },
            SignalPayload::Answer { sdp } => ServerMessage::ReceiveAnswer {
                room_id,
                from_user_id,
                sdp,
            },
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => ServerMessage::ReceiveIceCandidate {
                room_id,
                from_user_id,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            },
        }
    }
}

/// Registry status for health checks and tests.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub bound_connections: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Per-room policy, taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    /// Capacity for rooms created without an explicit one.
    pub default_max_participants: usize,
    /// Reconnect window after an unexpected disconnect.
    pub grace_period: Duration,
    /// How long an empty room lingers before it is removed.
    pub empty_room_idle: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            default_max_participants: 8,
            grace_period: Duration::from_secs(30),
            empty_room_idle: Duration::from_secs(10),
        }
    }
}
