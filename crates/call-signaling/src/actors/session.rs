//! Participant session state machine.
//!
//! ```text
//! Joining -> Active -> Disconnected -> Active   (reconnect)
//!                                   -> Removed  (grace expiry)
//! Active | Disconnected -> Removed              (explicit leave)
//! ```
//!
//! Every transition is a method returning `Result`; anything not drawn above
//! is an [`IllegalTransition`]. The room actor owns one `ParticipantState`
//! per participant and is the only caller.
//!
//! A disconnected participant carries the [`GraceTimer`] that will expire
//! it. Reconnect and leave hand the timer back so the caller cancels it
//! exactly once. Expiry is keyed by epoch, so a timer that fires after the
//! participant already reconnected (or reconnected and dropped again) finds
//! a different epoch and is rejected.

use crate::protocol::PresenceStatus;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellable handle to a scheduled grace-period expiry.
#[derive(Debug, Clone)]
pub struct GraceTimer {
    epoch: u64,
    cancel: CancellationToken,
}

impl GraceTimer {
    #[must_use]
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            cancel: CancellationToken::new(),
        }
    }

    /// Timer that is also cancelled when `parent` is (room shutdown).
    #[must_use]
    pub fn child_of(epoch: u64, parent: &CancellationToken) -> Self {
        Self {
            epoch,
            cancel: parent.child_token(),
        }
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Token observed by the timer task.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Transition attempted on a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Admit,
    Disconnect,
    Reconnect,
    Leave,
    GraceExpired,
}

impl SessionEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionEvent::Admit => "admit",
            SessionEvent::Disconnect => "disconnect",
            SessionEvent::Reconnect => "reconnect",
            SessionEvent::Leave => "leave",
            SessionEvent::GraceExpired => "grace_expired",
        }
    }
}

/// A transition not allowed from the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {} while {from}", event.as_str())]
pub struct IllegalTransition {
    pub from: &'static str,
    pub event: SessionEvent,
}

/// Lifecycle state of one participant in one room.
#[derive(Debug)]
pub enum ParticipantState {
    /// Admission checks in progress.
    Joining,
    /// Connected and visible to the room.
    Active,
    /// Channel dropped; waiting for a reconnect until the timer fires.
    Disconnected { since: Instant, timer: GraceTimer },
    /// Terminal.
    Removed,
}

impl ParticipantState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ParticipantState::Joining => "joining",
            ParticipantState::Active => "active",
            ParticipantState::Disconnected { .. } => "disconnected",
            ParticipantState::Removed => "removed",
        }
    }

    /// Presence as shown to other participants, if visible at all.
    #[must_use]
    pub const fn status(&self) -> Option<PresenceStatus> {
        match self {
            ParticipantState::Active => Some(PresenceStatus::Active),
            ParticipantState::Disconnected { .. } => Some(PresenceStatus::Disconnected),
            ParticipantState::Joining | ParticipantState::Removed => None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, ParticipantState::Active)
    }

    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, ParticipantState::Disconnected { .. })
    }

    /// When the participant dropped, if currently disconnected.
    #[must_use]
    pub fn disconnected_since(&self) -> Option<Instant> {
        match self {
            ParticipantState::Disconnected { since, .. } => Some(*since),
            _ => None,
        }
    }

    fn illegal(&self, event: SessionEvent) -> IllegalTransition {
        IllegalTransition {
            from: self.name(),
            event,
        }
    }

    /// `Joining -> Active`.
    ///
    /// # Errors
    ///
    /// Any other starting state.
    pub fn activate(&mut self) -> Result<(), IllegalTransition> {
        match self {
            ParticipantState::Joining => {
                *self = ParticipantState::Active;
                Ok(())
            }
            _ => Err(self.illegal(SessionEvent::Admit)),
        }
    }

    /// `Active -> Disconnected`, parking `timer` in the state.
    ///
    /// # Errors
    ///
    /// Any other starting state. The timer is dropped uncancelled; the caller
    /// must not have started it.
    pub fn disconnect(&mut self, timer: GraceTimer) -> Result<(), IllegalTransition> {
        match self {
            ParticipantState::Active => {
                *self = ParticipantState::Disconnected {
                    since: Instant::now(),
                    timer,
                };
                Ok(())
            }
            _ => Err(self.illegal(SessionEvent::Disconnect)),
        }
    }

    /// `Disconnected -> Active`, returning the pending timer for cancellation.
    ///
    /// # Errors
    ///
    /// Any other starting state, including `Active` (reconnecting an active
    /// participant is not a state change).
    pub fn reconnect(&mut self) -> Result<GraceTimer, IllegalTransition> {
        match std::mem::replace(self, ParticipantState::Active) {
            ParticipantState::Disconnected { timer, .. } => Ok(timer),
            other => {
                *self = other;
                Err(self.illegal(SessionEvent::Reconnect))
            }
        }
    }

    /// `Joining | Active | Disconnected -> Removed`.
    ///
    /// Returns the grace timer when leaving from `Disconnected`.
    ///
    /// # Errors
    ///
    /// Already `Removed`.
    pub fn remove(&mut self) -> Result<Option<GraceTimer>, IllegalTransition> {
        match std::mem::replace(self, ParticipantState::Removed) {
            ParticipantState::Disconnected { timer, .. } => Ok(Some(timer)),
            ParticipantState::Joining | ParticipantState::Active => Ok(None),
            ParticipantState::Removed => Err(self.illegal(SessionEvent::Leave)),
        }
    }

    /// `Disconnected -> Removed` when `epoch` matches the pending timer.
    ///
    /// # Errors
    ///
    /// Not disconnected, or the timer epoch is stale. The state is unchanged.
    pub fn expire(&mut self, epoch: u64) -> Result<(), IllegalTransition> {
        let current = matches!(
            self,
            ParticipantState::Disconnected { timer, .. } if timer.epoch() == epoch
        );
        if !current {
            return Err(self.illegal(SessionEvent::GraceExpired));
        }
        *self = ParticipantState::Removed;
        Ok(())
    }
}
