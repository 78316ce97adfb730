//! Per-channel read loop and request dispatch.
//!
//! The socket is split after the upgrade. The sink goes to a
//! [`ConnectionActor`] that owns all writes; the read half stays here and
//! handles one request at a time, replying through the same outbound queue
//! as room events so frames never interleave.
//!
//! A channel ending without `LeaveCall` (client vanished, idle timeout,
//! read error) is reported to the coordinator as an unexpected disconnect,
//! which starts the grace period in the room.

use crate::actors::{ConnectionActor, ConnectionHandle, JoinRequest, ReconnectRequest, SignalPayload};
use crate::coordinator::CallCoordinator;
use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::protocol::{ClientRequest, LeaveReason, RequestEnvelope, ServerMessage, MAX_FRAME_BYTES};

use super::auth::Identity;
use super::GatewayState;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// An authenticated channel: who is on it and where its replies go.
#[derive(Clone)]
pub struct Channel {
    identity: Identity,
    connection: ConnectionHandle,
    coordinator: CallCoordinator,
}

impl Channel {
    #[must_use]
    pub fn new(identity: Identity, connection: ConnectionHandle, coordinator: CallCoordinator) -> Self {
        Self {
            identity,
            connection,
            coordinator,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    /// Handle one inbound text frame and build the direct reply.
    ///
    /// Never fails: protocol and operation errors become `Error` frames
    /// that echo the request id when one could be read.
    pub async fn handle_text(&self, text: &str) -> ServerMessage {
        if text.len() > MAX_FRAME_BYTES {
            debug!(
                target: "cs.gateway",
                connection_id = %self.connection_id(),
                size = text.len(),
                "Frame exceeds maximum size"
            );
            return SignalingError::InvalidPayload(format!(
                "frame exceeds {MAX_FRAME_BYTES} bytes"
            ))
            .to_server_message(None);
        }

        let request_id = serde_json::from_str::<RequestEnvelope>(text)
            .unwrap_or_default()
            .request_id;

        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id(),
                    error = %e,
                    "Malformed frame"
                );
                return SignalingError::InvalidPayload("malformed request".to_string())
                    .to_server_message(request_id);
            }
        };

        let operation = request.operation();
        let start = Instant::now();

        let reply = match self.dispatch(request, request_id).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id(),
                    operation,
                    error = %e,
                    "Request rejected"
                );
                e.to_server_message(request_id)
            }
        };

        prom::record_message_latency(operation, start.elapsed());
        reply
    }

    #[instrument(skip_all, name = "cs.gateway.dispatch", fields(operation = request.operation()))]
    async fn dispatch(
        &self,
        request: ClientRequest,
        request_id: Option<u64>,
    ) -> Result<ServerMessage, SignalingError> {
        if let Some(claimed) = request.claimed_user_id() {
            if claimed != self.identity.user_id {
                warn!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id(),
                    operation = request.operation(),
                    "Payload user id does not match channel identity"
                );
                return Err(SignalingError::IdentityMismatch);
            }
        }

        let user_id = self.identity.user_id.as_str();
        let connection_id = self.connection.connection_id();

        match request {
            ClientRequest::JoinCall {
                room_id,
                display_name,
                audio_enabled,
                video_enabled,
                ..
            } => {
                let join = self.join_request(display_name, audio_enabled, video_enabled);
                let room = self.coordinator.join_call(&room_id, join).await?;
                Ok(ServerMessage::RoomState { request_id, room })
            }

            ClientRequest::ReconnectToCall {
                room_id,
                previous_connection_id,
                display_name,
                audio_enabled,
                video_enabled,
                ..
            } => {
                let request = ReconnectRequest {
                    join: self.join_request(
                        display_name,
                        audio_enabled.unwrap_or(true),
                        video_enabled.unwrap_or(true),
                    ),
                    previous_connection_id,
                };
                let room = self.coordinator.reconnect_to_call(&room_id, request).await?;
                Ok(ServerMessage::RoomState { request_id, room })
            }

            ClientRequest::LeaveCall { room_id, reason, .. } => {
                self.coordinator
                    .leave_call(
                        &room_id,
                        user_id,
                        connection_id,
                        reason.unwrap_or(LeaveReason::Voluntary),
                    )
                    .await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::GetRoomState { room_id } => {
                let room = self.coordinator.room_state(&room_id).await?;
                Ok(ServerMessage::RoomState { request_id, room })
            }

            ClientRequest::SendOffer {
                room_id,
                to_user_id,
                sdp,
            } => {
                self.relay(&room_id, &to_user_id, SignalPayload::Offer { sdp })
                    .await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::SendAnswer {
                room_id,
                to_user_id,
                sdp,
            } => {
                self.relay(&room_id, &to_user_id, SignalPayload::Answer { sdp })
                    .await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::SendIceCandidate {
                room_id,
                to_user_id,
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                let payload = SignalPayload::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                };
                self.relay(&room_id, &to_user_id, payload).await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::UpdateMediaState {
                room_id,
                audio_enabled,
                video_enabled,
                ..
            } => {
                self.coordinator
                    .update_media_state(&room_id, user_id, connection_id, audio_enabled, video_enabled)
                    .await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::UpdateNetworkQuality {
                room_id,
                quality,
                stats,
                ..
            } => {
                self.coordinator
                    .update_network_quality(&room_id, user_id, connection_id, quality, stats)
                    .await?;
                Ok(ServerMessage::Ack { request_id })
            }

            ClientRequest::GetIceConfiguration => {
                let configuration = self.coordinator.ice_configuration(user_id).await?;
                Ok(ServerMessage::IceConfiguration {
                    request_id,
                    configuration,
                })
            }

            ClientRequest::Ping => Ok(ServerMessage::Pong { request_id }),
        }
    }

    async fn relay(
        &self,
        room_id: &str,
        to_user_id: &str,
        payload: SignalPayload,
    ) -> Result<(), SignalingError> {
        self.coordinator
            .relay(
                room_id,
                &self.identity.user_id,
                self.connection.connection_id(),
                to_user_id,
                payload,
            )
            .await
    }

    /// Display name falls back to the token's name, then the user id.
    fn join_request(
        &self,
        display_name: Option<String>,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> JoinRequest {
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .or_else(|| self.identity.display_name.clone())
            .unwrap_or_else(|| self.identity.user_id.clone());

        JoinRequest {
            user_id: self.identity.user_id.clone(),
            display_name,
            connection: self.connection.clone(),
            audio_enabled,
            video_enabled,
        }
    }
}

/// Drive an upgraded socket until it closes.
#[instrument(skip_all, name = "cs.gateway.channel", fields(connection_id = tracing::field::Empty))]
pub async fn run_channel(socket: WebSocket, state: Arc<GatewayState>, identity: Identity) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let coordinator = state.coordinator.clone();
    let metrics = Arc::clone(coordinator.metrics());

    let (connection, receiver) = ConnectionHandle::new(
        connection_id.clone(),
        identity.user_id.clone(),
        coordinator.registry().child_token(),
    );
    metrics.connection_opened();

    let (sink, mut stream) = socket.split();
    let writer = ConnectionActor::new(&connection, receiver, sink, state.heartbeat_interval);
    let writer_task = tokio::spawn(writer.run());

    info!(target: "cs.gateway", connection_id = %connection_id, "Channel opened");

    let welcome = ServerMessage::Welcome {
        connection_id: connection_id.clone(),
        user_id: identity.user_id.clone(),
    };
    let channel = Channel::new(identity, connection.clone(), coordinator.clone());
    let cancel_token = connection.cancel_token().clone();

    if connection.respond(welcome).await.is_ok() {
        loop {
            tokio::select! {
                biased;

                () = cancel_token.cancelled() => {
                    debug!(target: "cs.gateway", connection_id = %connection_id, "Channel closed by server");
                    break;
                }

                frame = timeout(state.idle_timeout, stream.next()) => {
                    let reply = match frame {
                        Err(_) => {
                            info!(target: "cs.gateway", connection_id = %connection_id, "Channel idle timeout");
                            break;
                        }
                        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                        Ok(Some(Err(e))) => {
                            debug!(target: "cs.gateway", connection_id = %connection_id, error = %e, "Channel read failed");
                            break;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => channel.handle_text(&text).await,
                        Ok(Some(Ok(Message::Binary(_)))) => {
                            SignalingError::InvalidPayload("binary frames are not supported".to_string())
                                .to_server_message(None)
                        }
                        // Pings are answered by the transport; any frame resets the idle timer
                        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                    };

                    if connection.respond(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = coordinator.disconnect(&connection_id).await {
        debug!(
            target: "cs.gateway",
            connection_id = %connection_id,
            error = %e,
            "Disconnect cleanup failed"
        );
    }

    connection.close();
    if let Err(e) = writer_task.await {
        warn!(target: "cs.gateway", connection_id = %connection_id, error = %e, "Writer task failed");
    }
    metrics.connection_closed();

    info!(target: "cs.gateway", connection_id = %connection_id, "Channel closed");
}
