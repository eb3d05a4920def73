//! Session-level state machine

use log::{info, trace, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

/// セッション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Anonymous {
            return true;
        }
        matches!(
            (self, next),
            (Anonymous, Authenticating)
                | (Anonymous, Authenticated)
                | (Authenticating, Authenticated)
                | (Authenticating, Refreshing)
                | (Authenticated, Refreshing)
                | (Refreshing, Authenticated)
                | (Refreshing, Expired)
        )
    }

    /// Holds a credential the server should accept.
    pub fn is_signed_in(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Logout,
    RefreshFailed,
    RemoteLogout,
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Ended(EndReason),
}

/// Tracks the session state of one context and broadcasts its changes.
///
/// The epoch increases every time a session ends; work started under an
/// older epoch must not touch the current session.
pub struct SessionStateMachine {
    state: RwLock<SessionState>,
    epoch: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: RwLock::new(SessionState::Anonymous),
            epoch: AtomicU64::new(0),
            events,
        }
    }

    pub fn current(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Moves to `next` if the transition is allowed. Returns whether the
    /// session is in `next` afterwards.
    pub fn transition(&self, next: SessionState) -> bool {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            if previous == next {
                trace!("Session already {:?}", next);
                return true;
            }
            if !previous.can_transition_to(next) {
                warn!("Ignoring session transition {:?} -> {:?}", previous, next);
                return false;
            }
            *state = next;
            previous
        };

        info!("Session state {:?} -> {:?}", previous, next);
        let _ = self.events.send(SessionEvent::StateChanged(next));
        true
    }

    /// Returns to `Anonymous` and announces the end of the session. Ending
    /// an already anonymous session only bumps the epoch.
    pub fn end(&self, reason: EndReason) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, SessionState::Anonymous)
        };

        if previous == SessionState::Anonymous {
            trace!("Session end ({:?}) while already anonymous", reason);
            return;
        }

        info!("Session ended ({:?}), was {:?}", reason, previous);
        let _ = self.events.send(SessionEvent::StateChanged(SessionState::Anonymous));
        let _ = self.events.send(SessionEvent::Ended(reason));
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
