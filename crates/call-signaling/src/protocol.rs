//! Wire protocol for the client signaling channel.
//!
//! Every frame is a JSON text frame with a `type` discriminator. Client
//! requests may carry a numeric `requestId`; the direct reply to that request
//! echoes it. Broadcast events never carry one.
//!
//! ```text
//! client -> {"type":"JoinCall","requestId":1,"roomId":"r1","displayName":"Alice"}
//! server <- {"type":"RoomState","requestId":1,"room":{...}}
//! peers  <- {"type":"UserJoined","roomId":"r1","participant":{...}}
//! ```
//!
//! `fromUserId` on relayed messages is always filled in by the server from
//! the authenticated channel. Clients cannot supply it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// Maximum size of a single SDP or ICE candidate payload.
pub const MAX_SIGNALING_PAYLOAD_BYTES: usize = 64 * 1024;

/// Maximum size of an inbound frame (payload plus envelope).
pub const MAX_FRAME_BYTES: usize = 128 * 1024;

/// How often clients are expected to report network quality. Reports are
/// not rate limited.
pub const EXPECTED_NETWORK_QUALITY_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Shared value types
// ============================================================================

/// Reported network quality, best to worst.
///
/// Ordering follows quality: `Excellent > Good > ... > Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
    Disconnected,
}

impl NetworkQuality {
    /// Numeric score, higher is better.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            NetworkQuality::Excellent => 5,
            NetworkQuality::Good => 4,
            NetworkQuality::Fair => 3,
            NetworkQuality::Poor => 2,
            NetworkQuality::VeryPoor => 1,
            NetworkQuality::Disconnected => 0,
        }
    }
}

impl PartialOrd for NetworkQuality {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NetworkQuality {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score().cmp(&other.score())
    }
}

/// Optional transport statistics attached to a quality report.
///
/// Relayed as-is; the service does not average or smooth them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_trip_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
}

/// Why a participant left a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Client asked to leave.
    Voluntary,
    /// Grace period expired without a reconnect.
    Timeout,
    /// Removed administratively.
    Kicked,
}

impl LeaveReason {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LeaveReason::Voluntary => "voluntary",
            LeaveReason::Timeout => "timeout",
            LeaveReason::Kicked => "kicked",
        }
    }
}

/// Presence of a participant as seen by the rest of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceStatus {
    Active,
    Disconnected,
}

/// Stable error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomFull,
    RoomLocked,
    InvalidTarget,
    DuplicateSession,
    NotFound,
    Unauthenticated,
    Forbidden,
    Conflict,
    InvalidPayload,
    Unavailable,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::RoomLocked => "ROOM_LOCKED",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::DuplicateSession => "DUPLICATE_SESSION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// One participant as presented to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub network_quality: NetworkQuality,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
}

/// Full room state returned to a joiner so it can open a peer connection
/// to every existing participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub max_participants: usize,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    /// Ordered by `joined_at`, then `user_id`.
    pub participants: Vec<ParticipantSnapshot>,
}

impl RoomSnapshot {
    /// Look up a participant by user id.
    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantSnapshot> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

// ============================================================================
// ICE configuration
// ============================================================================

/// One STUN or TURN server descriptor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl fmt::Debug for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IceServer")
            .field("urls", &self.urls)
            .field("username", &self.username)
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// ICE server list handed to a client, opaque to this service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfiguration {
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

// ============================================================================
// Client -> server
// ============================================================================

fn default_true() -> bool {
    true
}

/// Envelope fields common to every request.
///
/// Parsed separately so a reply can echo `requestId` even when the body of
/// the request is malformed.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(default)]
    pub request_id: Option<u64>,
}

/// Requests a client may send on its channel.
///
/// `user_id` fields are optional. When present they must match the
/// authenticated identity of the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    JoinCall {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default = "default_true")]
        audio_enabled: bool,
        #[serde(default = "default_true")]
        video_enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    LeaveCall {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<LeaveReason>,
    },
    #[serde(rename_all = "camelCase")]
    ReconnectToCall {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        previous_connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_enabled: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_enabled: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    GetRoomState { room_id: String },
    #[serde(rename_all = "camelCase")]
    SendOffer {
        room_id: String,
        to_user_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    SendAnswer {
        room_id: String,
        to_user_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    SendIceCandidate {
        room_id: String,
        to_user_id: String,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            default,
            rename = "sdpMLineIndex",
            skip_serializing_if = "Option::is_none"
        )]
        sdp_m_line_index: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateMediaState {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_enabled: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_enabled: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateNetworkQuality {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        quality: NetworkQuality,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<NetworkStats>,
    },
    GetIceConfiguration,
    Ping,
}

impl ClientRequest {
    /// Bounded operation label for metrics and spans.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            ClientRequest::JoinCall { .. } => "join_call",
            ClientRequest::LeaveCall { .. } => "leave_call",
            ClientRequest::ReconnectToCall { .. } => "reconnect_to_call",
            ClientRequest::GetRoomState { .. } => "get_room_state",
            ClientRequest::SendOffer { .. } => "send_offer",
            ClientRequest::SendAnswer { .. } => "send_answer",
            ClientRequest::SendIceCandidate { .. } => "send_ice_candidate",
            ClientRequest::UpdateMediaState { .. } => "update_media_state",
            ClientRequest::UpdateNetworkQuality { .. } => "update_network_quality",
            ClientRequest::GetIceConfiguration => "get_ice_configuration",
            ClientRequest::Ping => "ping",
        }
    }

    /// User id the client claims to act as, if it sent one.
    #[must_use]
    pub fn claimed_user_id(&self) -> Option<&str> {
        match self {
            ClientRequest::JoinCall { user_id, .. }
            | ClientRequest::LeaveCall { user_id, .. }
            | ClientRequest::ReconnectToCall { user_id, .. }
            | ClientRequest::UpdateMediaState { user_id, .. }
            | ClientRequest::UpdateNetworkQuality { user_id, .. } => user_id.as_deref(),
            ClientRequest::GetRoomState { .. }
            | ClientRequest::SendOffer { .. }
            | ClientRequest::SendAnswer { .. }
            | ClientRequest::SendIceCandidate { .. }
            | ClientRequest::GetIceConfiguration
            | ClientRequest::Ping => None,
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Messages the server sends on a client channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame after the upgrade.
    #[serde(rename_all = "camelCase")]
    Welcome {
        connection_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    RoomState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        room: RoomSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    IceConfiguration {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        configuration: IceConfiguration,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        room_id: String,
        participant: ParticipantSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        room_id: String,
        user_id: String,
        reason: LeaveReason,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected { room_id: String, user_id: String },
    /// Back on a new channel. Network quality restarts at the value given
    /// until the client reports again.
    #[serde(rename_all = "camelCase")]
    UserReconnected {
        room_id: String,
        user_id: String,
        network_quality: NetworkQuality,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveOffer {
        room_id: String,
        from_user_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveAnswer {
        room_id: String,
        from_user_id: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveIceCandidate {
        room_id: String,
        from_user_id: String,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            default,
            rename = "sdpMLineIndex",
            skip_serializing_if = "Option::is_none"
        )]
        sdp_m_line_index: Option<u16>,
    },
    /// Only the fields that changed are present.
    #[serde(rename_all = "camelCase")]
    MediaStateChanged {
        room_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_enabled: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_enabled: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    NetworkQualityChanged {
        room_id: String,
        user_id: String,
        quality: NetworkQuality,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<NetworkStats>,
    },
}

impl ServerMessage {
    /// Bounded label for drop counters and debug logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::RoomState { .. } => "room_state",
            ServerMessage::IceConfiguration { .. } => "ice_configuration",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::UserJoined { .. } => "user_joined",
            ServerMessage::UserLeft { .. } => "user_left",
            ServerMessage::UserDisconnected { .. } => "user_disconnected",
            ServerMessage::UserReconnected { .. } => "user_reconnected",
            ServerMessage::ReceiveOffer { .. } => "receive_offer",
            ServerMessage::ReceiveAnswer { .. } => "receive_answer",
            ServerMessage::ReceiveIceCandidate { .. } => "receive_ice_candidate",
            ServerMessage::MediaStateChanged { .. } => "media_state_changed",
            ServerMessage::NetworkQualityChanged { .. } => "network_quality_changed",
        }
    }
}
