//! Per-channel outbound path.
//!
//! Each authenticated client channel has:
//! - A [`ConnectionHandle`], held by the gateway and by the room the
//!   participant is in. Rooms push events through it without waiting.
//! - A [`ConnectionActor`], the writer task that owns the socket sink,
//!   serializes queued [`ServerMessage`]s to JSON text frames and sends
//!   heartbeat pings.
//!
//! # Lifecycle
//!
//! 1. Created by the gateway right after the upgrade.
//! 2. Runs until the channel closes, a write fails, or the handle is closed
//!    (explicit close, reconnect takeover, or shutdown via the parent token).
//! 3. On close, already-queued messages are flushed, then a Close frame is sent.

use crate::errors::SignalingError;
use crate::protocol::ServerMessage;

use super::metrics::{ActorType, MailboxMonitor};

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outbound queue size per client channel.
pub const CONNECTION_CHANNEL_BUFFER: usize = 256;

/// Close code sent when the server ends the channel (1000 = normal closure).
const CLOSE_NORMAL: u16 = 1000;

/// Handle to a client channel's outbound queue.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: String,
    user_id: String,
    sender: mpsc::Sender<ServerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end for its writer.
    #[must_use]
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(
            connection_id,
            user_id,
            cancel_token,
            CONNECTION_CHANNEL_BUFFER,
        )
    }

    /// Like [`ConnectionHandle::new`] with an explicit queue size.
    #[must_use]
    pub fn with_capacity(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        cancel_token: CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let connection_id = connection_id.into();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        let handle = Self {
            connection_id,
            user_id: user_id.into(),
            sender,
            cancel_token,
            mailbox,
        };
        (handle, receiver)
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Authenticated user behind this channel.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an event without waiting.
    ///
    /// Returns `false` when the event was dropped (queue full or channel
    /// gone). Delivery is at-most-once.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.mailbox.record_enqueue();
                true
            }
            Err(TrySendError::Full(message)) => {
                debug!(
                    target: "cs.actor.connection",
                    connection_id = %self.connection_id,
                    kind = message.kind(),
                    "Outbound queue full, dropping event"
                );
                self.mailbox.record_drop();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a direct reply, waiting for queue space.
    ///
    /// # Errors
    ///
    /// `Internal` when the writer is gone.
    pub async fn respond(&self, message: ServerMessage) -> Result<(), SignalingError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    /// Close the channel. The writer flushes what is queued, then sends Close.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }

    /// Token cancelled when this channel closes.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }
}

/// Writer task for one client channel.
pub struct ConnectionActor<S> {
    connection_id: String,
    receiver: mpsc::Receiver<ServerMessage>,
    sink: S,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    heartbeat_interval: Duration,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    #[must_use]
    pub fn new(
        handle: &ConnectionHandle,
        receiver: mpsc::Receiver<ServerMessage>,
        sink: S,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            connection_id: handle.connection_id.clone(),
            receiver,
            sink,
            cancel_token: handle.cancel_token.clone(),
            mailbox: Arc::clone(&handle.mailbox),
            heartbeat_interval,
        }
    }

    /// Run the writer loop.
    #[instrument(skip_all, name = "cs.actor.connection", fields(connection_id = %self.connection_id))]
    pub async fn run(mut self) {
        debug!(
            target: "cs.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    self.flush_and_close().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_dequeue();
                    if let Err(e) = self.write(&message).await {
                        warn!(
                            target: "cs.actor.connection",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Write failed, closing channel"
                        );
                        self.cancel_token.cancel();
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new())).await {
                        debug!(
                            target: "cs.actor.connection",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Heartbeat ping failed, closing channel"
                        );
                        self.cancel_token.cancel();
                        break;
                    }
                }
            }
        }

        debug!(
            target: "cs.actor.connection",
            connection_id = %self.connection_id,
            messages_sent = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    async fn write(&mut self, message: &ServerMessage) -> Result<(), String> {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                // Skip the frame, keep the channel
                warn!(
                    target: "cs.actor.connection",
                    connection_id = %self.connection_id,
                    kind = message.kind(),
                    error = %e,
                    "Failed to serialize outbound message"
                );
                return Ok(());
            }
        };

        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| e.to_string())
    }

    async fn flush_and_close(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            self.mailbox.record_dequeue();
            if self.write(&message).await.is_err() {
                return;
            }
        }

        let close = Message::Close(Some(CloseFrame {
            code: CLOSE_NORMAL,
            reason: "closed".into(),
        }));
        let _ = self.sink.send(close).await;
        let _ = self.sink.close().await;
    }
}
