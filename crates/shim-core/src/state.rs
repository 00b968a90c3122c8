use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Connecting,
    Streaming,
    Waiting,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "Created",
            SessionState::Connecting => "Connecting",
            SessionState::Streaming => "Streaming",
            SessionState::Waiting => "Waiting",
            SessionState::Done => "Done",
            SessionState::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Connect,
    Connected,
    Drained,
    Exited,
    Fail,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionEvent::Connect => "Connect",
            SessionEvent::Connected => "Connected",
            SessionEvent::Drained => "Drained",
            SessionEvent::Exited => "Exited",
            SessionEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },
}

// ---------------------------------------------------------------------------
// SessionStateMachine
// ---------------------------------------------------------------------------

/// Tracks the shim session lifecycle.
///
/// The only path to `Waiting` is through `Drained`, which is what keeps the
/// remote wait behind the stdio join barrier.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    current: SessionState,
    history: Vec<(SessionState, SessionEvent, SessionState)>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            current: SessionState::Created,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[(SessionState, SessionEvent, SessionState)] {
        &self.history
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Created    + Connect   -> Connecting
    /// - Connecting + Connected -> Streaming
    /// - Streaming  + Drained   -> Waiting
    /// - Waiting    + Exited    -> Done
    /// - any non-terminal state + Fail -> Failed
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionState, StateMachineError> {
        let next = match (self.current, event) {
            (SessionState::Created, SessionEvent::Connect) => SessionState::Connecting,
            (SessionState::Connecting, SessionEvent::Connected) => SessionState::Streaming,
            (SessionState::Streaming, SessionEvent::Drained) => SessionState::Waiting,
            (SessionState::Waiting, SessionEvent::Exited) => SessionState::Done,
            (state, SessionEvent::Fail) if !state.is_terminal() => SessionState::Failed,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "session state transition");
        Ok(next)
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
