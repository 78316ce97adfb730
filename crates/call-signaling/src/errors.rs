//! Call signaling error types.
//!
//! Every variant maps to a stable wire [`ErrorCode`] and a client-safe
//! message. Internal details are logged server-side but never sent to
//! clients. Over HTTP (the upgrade endpoint) the same errors map to status
//! codes via the `IntoResponse` impl.

use crate::protocol::{ErrorCode, ServerMessage};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Call signaling error type.
///
/// Maps to wire error codes:
/// - `RoomFull`: `ROOM_FULL`
/// - `RoomLocked`: `ROOM_LOCKED`
/// - `InvalidTarget`: `INVALID_TARGET`
/// - `DuplicateSession`: `DUPLICATE_SESSION`
/// - `RoomNotFound`, `NotParticipant`: `NOT_FOUND`
/// - `Unauthenticated`: `UNAUTHENTICATED`
/// - `IdentityMismatch`: `FORBIDDEN`
/// - `ConnectionInUse`: `CONFLICT`
/// - `InvalidPayload`: `INVALID_PAYLOAD`
/// - `IceUnavailable`, `Draining`, `RoomClosed`: `UNAVAILABLE`
/// - `Internal`, `Config`: `INTERNAL`
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Room is at capacity.
    #[error("Room is full (max {max_participants} participants)")]
    RoomFull { max_participants: usize },

    /// Room is administratively locked.
    #[error("Room is locked")]
    RoomLocked,

    /// Relay sender or target is not an active participant.
    #[error("Invalid relay target: {0}")]
    InvalidTarget(String),

    /// User already holds an active session in the room.
    #[error("Duplicate session for user in room")]
    DuplicateSession,

    /// Room does not exist.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Caller is not an active participant of the room.
    #[error("Not a participant of room: {0}")]
    NotParticipant(String),

    /// Channel has no verified identity.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Payload user id differs from the channel identity.
    #[error("User id does not match authenticated identity")]
    IdentityMismatch,

    /// Channel is already bound to a different room.
    #[error("Connection already bound to another room")]
    ConnectionInUse,

    /// Frame could not be parsed or violates size limits.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// ICE configuration provider failed.
    #[error("ICE configuration unavailable: {0}")]
    IceUnavailable(String),

    /// Service is shutting down and not accepting joins.
    #[error("Service is draining")]
    Draining,

    /// Room actor closed while a request was in flight.
    #[error("Room closed")]
    RoomClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the wire `ErrorCode` for this error.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            SignalingError::RoomFull { .. } => ErrorCode::RoomFull,
            SignalingError::RoomLocked => ErrorCode::RoomLocked,
            SignalingError::InvalidTarget(_) => ErrorCode::InvalidTarget,
            SignalingError::DuplicateSession => ErrorCode::DuplicateSession,
            SignalingError::RoomNotFound(_) | SignalingError::NotParticipant(_) => {
                ErrorCode::NotFound
            }
            SignalingError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            SignalingError::IdentityMismatch => ErrorCode::Forbidden,
            SignalingError::ConnectionInUse => ErrorCode::Conflict,
            SignalingError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            SignalingError::IceUnavailable(_)
            | SignalingError::Draining
            | SignalingError::RoomClosed => ErrorCode::Unavailable,
            SignalingError::Config(_) | SignalingError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns a bounded label for metrics (one per variant).
    #[must_use]
    pub const fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::RoomFull { .. } => "room_full",
            SignalingError::RoomLocked => "room_locked",
            SignalingError::InvalidTarget(_) => "invalid_target",
            SignalingError::DuplicateSession => "duplicate_session",
            SignalingError::RoomNotFound(_) => "room_not_found",
            SignalingError::NotParticipant(_) => "not_participant",
            SignalingError::Unauthenticated(_) => "unauthenticated",
            SignalingError::IdentityMismatch => "identity_mismatch",
            SignalingError::ConnectionInUse => "connection_in_use",
            SignalingError::InvalidPayload(_) => "invalid_payload",
            SignalingError::IceUnavailable(_) => "ice_unavailable",
            SignalingError::Draining => "draining",
            SignalingError::RoomClosed => "room_closed",
            SignalingError::Config(_) => "config",
            SignalingError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::RoomFull { max_participants } => {
                format!("Room is full ({max_participants} participants)")
            }
            SignalingError::RoomLocked => "Room is locked".to_string(),
            SignalingError::InvalidTarget(_) => {
                "Target is not an active participant of this room".to_string()
            }
            SignalingError::DuplicateSession => {
                "Already in this room on another connection; leave first".to_string()
            }
            SignalingError::RoomNotFound(_) => "Room not found".to_string(),
            SignalingError::NotParticipant(_) => "Not a participant of this room".to_string(),
            SignalingError::Unauthenticated(_) => {
                "The access token is invalid or expired".to_string()
            }
            SignalingError::IdentityMismatch => {
                "User id does not match the authenticated identity".to_string()
            }
            SignalingError::ConnectionInUse => {
                "This connection is already in another room".to_string()
            }
            SignalingError::InvalidPayload(reason) => format!("Invalid payload: {reason}"),
            SignalingError::IceUnavailable(_) => {
                "ICE configuration is temporarily unavailable".to_string()
            }
            SignalingError::Draining => "Server is shutting down, please reconnect".to_string(),
            SignalingError::RoomClosed => "Room is closing, please retry".to_string(),
            SignalingError::Config(_) | SignalingError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Build the `Error` frame replying to `request_id`.
    #[must_use]
    pub fn to_server_message(&self, request_id: Option<u64>) -> ServerMessage {
        ServerMessage::Error {
            request_id,
            code: self.error_code(),
            message: self.client_message(),
        }
    }

    /// HTTP status for errors surfaced before the channel upgrade.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            SignalingError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            SignalingError::IdentityMismatch => StatusCode::FORBIDDEN,
            SignalingError::RoomNotFound(_) | SignalingError::NotParticipant(_) => {
                StatusCode::NOT_FOUND
            }
            SignalingError::RoomFull { .. }
            | SignalingError::RoomLocked
            | SignalingError::DuplicateSession
            | SignalingError::ConnectionInUse => StatusCode::CONFLICT,
            SignalingError::InvalidTarget(_) | SignalingError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            SignalingError::IceUnavailable(_)
            | SignalingError::Draining
            | SignalingError::RoomClosed => StatusCode::SERVICE_UNAVAILABLE,
            SignalingError::Config(_) | SignalingError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let SignalingError::Internal(err) | SignalingError::Config(err) = &self {
            tracing::error!(target: "cs.gateway", error = %err, "Request failed");
        }

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().as_str().to_string(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) =
                "Bearer realm=\"call-signaling\", error=\"invalid_token\"".parse()
            {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}
