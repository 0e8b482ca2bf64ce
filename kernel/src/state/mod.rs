// Connection State Machine
//
// Tracks a stream connection through its lifecycle:
// AUTHORIZING -> REPLAYING -> LIVE -> CLOSED.
// This module is pure, deterministic, and side-effect free.

use std::fmt;

use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::log::{BuildId, Seq};

/// Opaque per-stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting on the authorization gate. Nothing may be read yet.
    Authorizing,

    /// Draining history from the event log.
    Replaying,

    /// Subscribed to the live bridge.
    Live,

    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Denied,
    Terminal,
    Disconnected,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Authorized,
    HistoryDrained,
    Close(CloseReason),
}

/// Errors produced during state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    close_reason: Option<CloseReason>,
}

impl ConnectionStateMachine {
    /// Create a state machine for a freshly accepted connection.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Authorizing,
            close_reason: None,
        }
    }

    pub fn apply(&mut self, transition: Transition) -> Result<(), StateError> {
        use ConnectionState::*;
        use Transition::*;

        self.state = match (self.state, transition) {
            (Authorizing, Authorized) => Replaying,
            (Replaying, HistoryDrained) => Live,

            // Any open connection may close; closing twice is not a transition.
            (Authorizing | Replaying | Live, Close(reason)) => {
                self.close_reason = Some(reason);
                Closed
            }

            (state, transition) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {transition:?} while in {state:?}"
                )))
            }
        };

        Ok(())
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// One client stream. Owns no event data, only its bindings and state.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub build_id: BuildId,
    pub caller: CallerIdentity,
    /// Highest `seq` the client claims to have already received.
    pub checkpoint: Seq,
    machine: ConnectionStateMachine,
}

impl Connection {
    pub fn accept(build_id: BuildId, caller: CallerIdentity, checkpoint: Seq) -> Self {
        Self {
            id: ConnectionId::new(),
            build_id,
            caller,
            checkpoint,
            machine: ConnectionStateMachine::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.current_state()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.machine.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn advance(&mut self, transition: Transition) -> Result<(), StateError> {
        let from = self.state();
        self.machine.apply(transition)?;
        tracing::debug!(
            connection_id = %self.id,
            build_id = %self.build_id,
            ?from,
            to = ?self.state(),
            "connection state changed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_lifecycle() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.current_state(), ConnectionState::Authorizing);

        sm.apply(Transition::Authorized).unwrap();
        assert_eq!(sm.current_state(), ConnectionState::Replaying);

        sm.apply(Transition::HistoryDrained).unwrap();
        assert_eq!(sm.current_state(), ConnectionState::Live);

        sm.apply(Transition::Close(CloseReason::Terminal)).unwrap();
        assert_eq!(sm.current_state(), ConnectionState::Closed);
        assert_eq!(sm.close_reason(), Some(CloseReason::Terminal));
    }

    #[test]
    fn denial_closes_before_replay() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(Transition::Close(CloseReason::Denied)).unwrap();
        assert_eq!(sm.current_state(), ConnectionState::Closed);

        let err = sm.apply(Transition::Authorized).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));
    }

    #[test]
    fn cannot_go_live_without_replay() {
        let mut sm = ConnectionStateMachine::new();
        let err = sm.apply(Transition::HistoryDrained).unwrap_err();
        assert!(err.to_string().contains("Authorizing"));
    }

    #[test]
    fn closing_twice_is_rejected() {
        let mut connection = Connection::accept(
            BuildId::new(),
            CallerIdentity::verified("user123"),
            0,
        );
        connection
            .advance(Transition::Close(CloseReason::Disconnected))
            .unwrap();
        assert!(connection.is_closed());
        assert!(connection
            .advance(Transition::Close(CloseReason::Failed))
            .is_err());
        assert_eq!(connection.close_reason(), Some(CloseReason::Disconnected));
    }
}
