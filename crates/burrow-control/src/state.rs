//! Presence state machine for a tunnel's bridge

use thiserror::Error;

/// Lifecycle of a request bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Registered, no client socket seen yet
    Created,
    /// At least one client socket connected
    Online,
    /// Every client socket is gone; the grace timer is running
    Offline,
    /// Terminal
    Closed,
}

/// Inputs driving [`BridgeState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeInput {
    /// The broker's socket count went from 0 to 1
    SocketOnline,
    /// The broker's socket count dropped to 0
    SocketOffline,
    /// The grace timer fired
    GraceExpired,
    /// The broker stopped accepting sockets
    BrokerEnd,
    /// Explicit close
    Close,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal bridge transition: {input:?} in state {state:?}")]
pub struct TransitionError {
    pub state: BridgeState,
    pub input: BridgeInput,
}

impl BridgeState {
    /// Compute the state reached by applying `input`
    pub fn next(self, input: BridgeInput) -> Result<BridgeState, TransitionError> {
        use BridgeInput::*;
        use BridgeState::*;

        match (self, input) {
            (Closed, Close) => Ok(Closed),
            (Closed, _) => Err(TransitionError { state: self, input }),

            (_, Close) | (_, BrokerEnd) => Ok(Closed),

            (Created, SocketOnline) | (Offline, SocketOnline) => Ok(Online),
            (Online, SocketOffline) => Ok(Offline),
            (Offline, GraceExpired) => Ok(Closed),

            _ => Err(TransitionError { state: self, input }),
        }
    }

    pub fn is_closed(self) -> bool {
        self == BridgeState::Closed
    }
}
