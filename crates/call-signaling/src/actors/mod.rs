//! Actor model for call signaling.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns participants, lock flag, capacity
//!         ├── runs grace and idle timers
//!         └── pushes events into ConnectionHandles
//!             └── ConnectionActor (one writer per client channel)
//! ```
//!
//! Every actor is a tokio task with a bounded mailbox. Handles are cheap to
//! clone and are the only way to reach an actor. Cancellation flows down
//! from the registry's root token.

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod session;

pub use connection::{ConnectionActor, ConnectionHandle, CONNECTION_CHANNEL_BUFFER};
pub use messages::{JoinRequest, ReconnectRequest, RegistryStatus, RoomSettings, SignalPayload};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use registry::RoomRegistryHandle;
pub use room::RoomHandle;
pub use session::{GraceTimer, IllegalTransition, ParticipantState, SessionEvent};
