//! Connection lifecycle state machine
//!
//! Pure transition table; the per-connection task in `connection.rs` applies
//! events and performs the side effects (registry insert/remove, socket close).

use std::fmt;

use thiserror::Error;

/// Lifecycle state of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// TCP accepted, waiting for the upgrade request
    Connecting,
    /// Handshake complete, registered, frames flow both ways
    Open,
    /// Close frame sent or received, waiting for the closing handshake to finish
    Closing,
    /// Socket torn down and deregistered
    Closed,
    /// Torn down after an unrecoverable I/O or protocol error
    Errored,
}

/// Something that happened to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// 101 Switching Protocols was flushed
    HandshakeAccepted,
    /// An HTTP error response was sent instead of 101
    HandshakeRejected,
    /// Peer sent a Close frame
    CloseReceived,
    /// We sent a Close frame
    CloseSent,
    /// Socket fully closed
    SocketClosed,
    /// Decode error, write error or other unrecoverable failure
    Failed,
}

/// Event not allowed in the current state
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid lifecycle transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub event: LifecycleEvent,
}

impl ConnectionState {
    /// Apply an event, returning the next state
    pub fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use ConnectionState::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Connecting, HandshakeAccepted) => Open,
            (Connecting, HandshakeRejected | SocketClosed) => Closed,
            (Open | Closing, CloseReceived | CloseSent) => Closing,
            (Open | Closing, SocketClosed) => Closed,
            (Connecting | Open | Closing, Failed) => Errored,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Closed or Errored
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }

    /// Whether a connection in this state belongs in the registry
    pub fn is_registered(self) -> bool {
        self == ConnectionState::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}
