//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the top-level actor of the service:
//!
//! - Singleton per process
//! - Maps room ids to live `RoomActor` instances, creating them on first use
//! - Tracks which room each client channel is bound to
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Rooms remove themselves: an idle room tells the registry it closed, and
//! the registry drops it only if the closing instance is still the one it
//! maps the id to. A room re-created under the same id gets a fresh
//! instance and never sees state from the old one.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the registry:
//! 1. Stops creating rooms (`Draining` for new joins)
//! 2. Cancels the root `CancellationToken` (propagates to all rooms and channels)
//! 3. Waits for room tasks to finish

use crate::errors::SignalingError;

use super::messages::{RegistryMessage, RegistryStatus, RoomSettings};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `RoomRegistryActor`.
///
/// This is the public interface for interacting with the registry.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(instance_id: String, settings: RoomSettings, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor::new(
            instance_id,
            receiver,
            sender.downgrade(),
            cancel_token.clone(),
            settings,
            metrics,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Find a room, creating it if absent.
    ///
    /// `max_participants` applies only when the room is created here.
    pub async fn get_or_create_room(
        &self,
        room_id: String,
        max_participants: Option<usize>,
    ) -> Result<RoomHandle, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetOrCreateRoom {
            room_id,
            max_participants,
            respond_to,
        })
        .await?
    }

    /// Find an existing room without creating it.
    pub async fn get_room(&self, room_id: String) -> Result<Option<RoomHandle>, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            room_id,
            respond_to,
        })
        .await
    }

    /// Resolve a room, creating it if absent, and bind a channel to it.
    ///
    /// The binding names the room instance returned, so only that
    /// instance closing can clear it. The flag is `true` when the binding
    /// is new, `false` when the channel was already bound to this room.
    pub async fn bind_room(
        &self,
        connection_id: String,
        room_id: String,
    ) -> Result<(RoomHandle, bool), SignalingError> {
        self.request(|respond_to| RegistryMessage::BindRoom {
            connection_id,
            room_id,
            respond_to,
        })
        .await?
    }

    /// Drop a channel's binding if it still points at `room_id`.
    pub async fn release_connection(
        &self,
        connection_id: String,
        room_id: String,
    ) -> Result<(), SignalingError> {
        self.sender
            .send(RegistryMessage::ReleaseConnection {
                connection_id,
                room_id,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))
    }

    /// Room the channel is bound to, if any.
    pub async fn lookup_connection(
        &self,
        connection_id: String,
    ) -> Result<Option<String>, SignalingError> {
        self.request(|respond_to| RegistryMessage::LookupConnection {
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SignalingError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token, e.g. for client channels.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Room instance a channel is bound to.
#[derive(Debug)]
struct Binding {
    room_id: String,
    room_instance: u64,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Given to rooms so they can report closure.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    /// Root token.
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    /// Channel id to room instance.
    bindings: HashMap<String, Binding>,
    next_room_instance: u64,
    accepting_new: bool,
    settings: RoomSettings,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    fn new(
        instance_id: String,
        receiver: mpsc::Receiver<RegistryMessage>,
        self_sender: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Registry, &instance_id);

        Self {
            instance_id,
            receiver,
            self_sender,
            cancel_token,
            rooms: HashMap::new(),
            bindings: HashMap::new(),
            next_room_instance: 0,
            accepting_new: true,
            settings,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cs.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cs.actor.registry",
                        instance_id = %self.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "cs.actor.registry",
                                instance_id = %self.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                max_participants,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id, max_participants);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&room_id)
                    .filter(|managed| !managed.handle.is_closed())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::RoomClosed {
                room_id,
                instance_id,
            } => {
                self.room_closed(&room_id, instance_id);
            }

            RegistryMessage::BindRoom {
                connection_id,
                room_id,
                respond_to,
            } => {
                let result = self.bind_room(connection_id, room_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::ReleaseConnection {
                connection_id,
                room_id,
            } => {
                if self
                    .bindings
                    .get(&connection_id)
                    .is_some_and(|binding| binding.room_id == room_id)
                {
                    self.bindings.remove(&connection_id);
                }
            }

            RegistryMessage::LookupConnection {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(
                    self.bindings
                        .get(&connection_id)
                        .map(|binding| binding.room_id.clone()),
                );
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    fn get_or_create_room(
        &mut self,
        room_id: String,
        max_participants: Option<usize>,
    ) -> Result<RoomHandle, SignalingError> {
        if !self.accepting_new {
            return Err(SignalingError::Draining);
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() {
                return Ok(managed.handle.clone());
            }
            // Closed but its notice has not arrived yet
            self.forget_room(&room_id);
        }

        self.next_room_instance += 1;
        let instance_id = self.next_room_instance;
        let max_participants =
            max_participants.unwrap_or(self.settings.default_max_participants);

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            instance_id,
            max_participants,
            self.settings,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
            Some(self.self_sender.clone()),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            room_instance = instance_id,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    fn room_closed(&mut self, room_id: &str, instance_id: u64) {
        let current = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| managed.handle.instance_id() == instance_id);
        if !current {
            debug!(
                target: "cs.actor.registry",
                room_id = %room_id,
                room_instance = instance_id,
                "Closure notice for replaced room ignored"
            );
            return;
        }

        self.forget_room(room_id);
    }

    /// Drop a room and its bindings without blocking the message loop.
    fn forget_room(&mut self, room_id: &str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };
        self.release_instance_bindings(room_id, managed.handle.instance_id());
        self.metrics.room_removed();

        let lifetime_secs = (chrono::Utc::now() - managed.created_at).num_seconds();
        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            lifetime_secs = lifetime_secs,
            total_rooms = self.rooms.len(),
            "Room actor removed"
        );

        // Spawn background task to wait for cleanup
        let room_id_owned = room_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cs.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cs.actor.registry",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task failed during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cs.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });
    }

    fn bind_room(
        &mut self,
        connection_id: String,
        room_id: String,
    ) -> Result<(RoomHandle, bool), SignalingError> {
        if self
            .bindings
            .get(&connection_id)
            .is_some_and(|binding| binding.room_id != room_id)
        {
            return Err(SignalingError::ConnectionInUse);
        }

        let room = self.get_or_create_room(room_id.clone(), None)?;
        let binding = Binding {
            room_id,
            room_instance: room.instance_id(),
        };
        let newly_bound = self.bindings.insert(connection_id, binding).is_none();
        Ok((room, newly_bound))
    }

    /// Drop bindings that point at one particular room instance.
    ///
    /// Bindings already moved to a newer instance of the same id are kept.
    fn release_instance_bindings(&mut self, room_id: &str, room_instance: u64) {
        self.bindings.retain(|_, binding| {
            binding.room_id != room_id || binding.room_instance != room_instance
        });
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            bound_connections: self.bindings.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), SignalingError> {
        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            room_count = self.rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;

        // Propagates to all rooms and channels
        self.cancel_token.cancel();

        Ok(())
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;
        self.bindings.clear();

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(Duration::from_secs(30), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "cs.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "cs.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "cs.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "cs.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.release_instance_bindings(&room_id, managed.handle.instance_id());
            self.metrics.room_removed();

            match managed.task_handle.await {
                Ok(()) => {
                    // Idle close whose notice was lost or not yet processed
                    debug!(
                        target: "cs.actor.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "cs.actor.registry",
                            instance_id = %self.instance_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
        }
    }
}
