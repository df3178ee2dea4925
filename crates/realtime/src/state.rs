//! Connection state machine.

use crate::types::ConnectionState;

/// A state change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// A transition outside the allowed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Holds the current [`ConnectionState`] and enforces the transition table.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves to `next`.
    ///
    /// Returns `Ok(None)` for a no-op (already in `next`), so callers emit a
    /// notification only when `Ok(Some(_))` comes back.
    pub(crate) fn transition(
        &mut self,
        next: ConnectionState,
    ) -> Result<Option<Transition>, IllegalTransition> {
        if self.state == next {
            return Ok(None);
        }
        if !is_allowed(self.state, next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = std::mem::replace(&mut self.state, next);
        Ok(Some(Transition {
            previous,
            current: next,
        }))
    }
}

/// The allowed transition table.
pub fn is_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    match to {
        Disconnected => true,
        Connecting => matches!(from, Disconnected | Reconnecting | Failed),
        Connected => from == Connecting,
        // The close handler passes through Disconnected before scheduling.
        Reconnecting => matches!(from, Connected | Connecting | Disconnected),
        Failed => matches!(from, Connecting | Reconnecting | Disconnected),
    }
}
