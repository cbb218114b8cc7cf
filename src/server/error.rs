//! Error types for the connection pipeline
//!
//! Every error here is scoped to a single connection. None of them is allowed
//! to escape the connection task or reach the listener.

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::Error as WsError;

use super::lifecycle::TransitionError;

// ============================================================================
// Handshake
// ============================================================================

/// Rejected or failed HTTP upgrade
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Malformed upgrade request: {0}")]
    Malformed(String),

    #[error("Request head exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Upgrade requires GET, got {0}")]
    InvalidMethod(String),

    #[error("No WebSocket endpoint at {0}")]
    NotFound(String),

    #[error("Upgrade required: {0}")]
    UpgradeRequired(String),

    #[error("Invalid Sec-WebSocket-Key: {0}")]
    InvalidKey(String),

    #[error("Client disconnected before sending a request")]
    Disconnected,

    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// HTTP status and reason phrase answering this error, if any is sent
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            HandshakeError::Malformed(_)
            | HandshakeError::HeaderTooLarge(_)
            | HandshakeError::InvalidMethod(_)
            | HandshakeError::InvalidKey(_) => Some((400, "Bad Request")),
            HandshakeError::NotFound(_) => Some((404, "Not Found")),
            HandshakeError::UpgradeRequired(_) => Some((426, "Upgrade Required")),
            HandshakeError::Disconnected | HandshakeError::Io(_) => None,
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Malformed or unsupported WebSocket traffic
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unsupported {0} frame, only text frames are accepted")]
    UnsupportedFrame(&'static str),

    #[error("Frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Text frame is not valid UTF-8")]
    InvalidPayload,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl ProtocolError {
    /// Close code reported to the peer before the connection is dropped
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::UnsupportedFrame(_) => 1003,
            ProtocolError::FrameTooLarge { .. } => 1009,
            ProtocolError::InvalidPayload => 1007,
            ProtocolError::InvalidFrame(_) => 1002,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Failure delivering a broadcast to one recipient
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Recipient is no longer connected")]
    Disconnected,
}

// ============================================================================
// Connection
// ============================================================================

/// Any error that ends a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Dropped as a broadcast recipient: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ConnectionError {
    /// Close code to send before tearing the connection down, if the socket is still usable
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ConnectionError::Protocol(e) => Some(e.close_code()),
            ConnectionError::Dispatch(_) => Some(1008),
            ConnectionError::Transition(_) => Some(1011),
            ConnectionError::Handshake(_) | ConnectionError::Io(_) => None,
        }
    }
}

impl From<WsError> for ConnectionError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Io(e) => ConnectionError::Io(e),
            WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Io(
                io::Error::new(io::ErrorKind::NotConnected, "connection already closed"),
            ),
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                ConnectionError::Protocol(ProtocolError::FrameTooLarge {
                    size,
                    max: max_size,
                })
            }
            WsError::Utf8 { .. } => ConnectionError::Protocol(ProtocolError::InvalidPayload),
            other => ConnectionError::Protocol(ProtocolError::InvalidFrame(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_status_codes() {
        assert_eq!(
            HandshakeError::Malformed("x".into()).status(),
            Some((400, "Bad Request"))
        );
        assert_eq!(
            HandshakeError::InvalidKey("x".into()).status().map(|s| s.0),
            Some(400)
        );
        assert_eq!(
            HandshakeError::NotFound("/x".into()).status().map(|s| s.0),
            Some(404)
        );
        assert_eq!(
            HandshakeError::UpgradeRequired("x".into()).status().map(|s| s.0),
            Some(426)
        );
        assert_eq!(HandshakeError::Disconnected.status(), None);
    }

    #[test]
    fn test_capacity_error_maps_to_frame_too_large() {
        let err = ConnectionError::from(WsError::Capacity(CapacityError::MessageTooLong {
            size: 10,
            max_size: 5,
        }));
        match err {
            ConnectionError::Protocol(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!((size, max), (10, 5));
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_close_codes() {
        let err = ConnectionError::from(ProtocolError::UnsupportedFrame("binary"));
        assert_eq!(err.close_code(), Some(1003));

        let err = ConnectionError::from(DispatchError::QueueFull);
        assert_eq!(err.close_code(), Some(1008));

        let err = ConnectionError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.close_code(), None);
    }

    #[test]
    fn test_invalid_utf8_closes_with_1007() {
        let err = ConnectionError::from(WsError::Utf8);
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::InvalidPayload)
        ));
        assert_eq!(err.close_code(), Some(1007));
    }
}
