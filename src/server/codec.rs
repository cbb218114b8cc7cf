//! WebSocket frame codec
//!
//! Wire framing is delegated to tungstenite. This module narrows its message
//! type down to the frames the server supports and puts the framing library
//! behind [`FrameTransport`], so the connection task does not depend on it.

use std::borrow::Cow;
use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::error::{ConnectionError, ProtocolError};

/// Code and reason carried by a Close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl TryFrom<Message> for Frame {
    type Error = ProtocolError;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        match message {
            Message::Text(text) => Ok(Frame::Text(text)),
            Message::Ping(payload) => Ok(Frame::Ping(payload)),
            Message::Pong(payload) => Ok(Frame::Pong(payload)),
            Message::Close(frame) => Ok(Frame::Close(frame.map(|f| CloseReason {
                code: f.code.into(),
                reason: f.reason.into_owned(),
            }))),
            Message::Binary(_) => Err(ProtocolError::UnsupportedFrame("binary")),
            Message::Frame(_) => Err(ProtocolError::UnsupportedFrame("raw")),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: CloseCode::from(r.code),
                reason: Cow::Owned(r.reason),
            })),
        }
    }
}

/// Limits applied by the codec
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    /// Largest accepted frame payload, also the largest reassembled message
    pub max_frame_size: usize,
    /// Largest text frame the server writes
    pub max_outbound_size: usize,
}

impl CodecConfig {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            max_outbound_size: max_frame_size,
        }
    }

    /// Let outgoing text exceed the inbound limit, e.g. for a broadcast prefix
    pub fn with_max_outbound_size(mut self, max_outbound_size: usize) -> Self {
        self.max_outbound_size = max_outbound_size.max(self.max_frame_size);
        self
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(self.max_frame_size);
        config.max_message_size = Some(self.max_frame_size);
        config
    }
}

/// Frame-level view of an upgraded connection.
///
/// `recv` yields `None` once the peer has gone away or the closing handshake
/// has finished; it never yields binary frames.
pub trait FrameTransport: Send {
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, ConnectionError>>> + Send;

    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// [`FrameTransport`] backed by tokio-tungstenite
pub struct TungsteniteTransport<S> {
    inner: WebSocketStream<S>,
    config: CodecConfig,
}

impl<S> TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a socket whose 101 response has already been sent.
    ///
    /// `leftover` holds bytes read past the request head.
    pub async fn upgrade(stream: S, leftover: Vec<u8>, config: CodecConfig) -> Self {
        let inner = WebSocketStream::from_partially_read(
            stream,
            leftover,
            Role::Server,
            Some(config.websocket_config()),
        )
        .await;
        Self { inner, config }
    }
}

impl<S> FrameTransport for TungsteniteTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Frame::try_from(message).map_err(ConnectionError::from))
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if let Frame::Text(text) = &frame {
            if text.len() > self.config.max_outbound_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: text.len(),
                    max: self.config.max_outbound_size,
                }
                .into());
            }
        }

        let closing = matches!(frame, Frame::Close(_));
        match self.inner.send(Message::from(frame)).await {
            Ok(()) => Ok(()),
            // Echoing a peer's Close completes the handshake and ends the stream
            Err(WsError::ConnectionClosed) if closing => Ok(()),
            // Peer closed first; tungstenite has queued its own echo, push it out
            Err(WsError::Protocol(WsProtocolError::SendAfterClosing)) if closing => {
                match self.inner.flush().await {
                    Ok(()) | Err(WsError::ConnectionClosed) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
