//! WebSocket server module
//!
//! Accepts connections, negotiates the upgrade, and fans every text message
//! out to every open connection.

mod codec;
mod connection;
mod dispatch;
mod error;
mod handshake;
mod lifecycle;
mod registry;
mod websocket;

#[allow(unused_imports)]
pub use codec::{CloseReason, CodecConfig, Frame, FrameTransport, TungsteniteTransport};
#[allow(unused_imports)]
pub use connection::{Connection, ConnectionContext};
#[allow(unused_imports)]
pub use dispatch::{DispatchReport, Dispatcher};
#[allow(unused_imports)]
pub use error::{ConnectionError, DispatchError, HandshakeError, ProtocolError};
#[allow(unused_imports)]
pub use handshake::{accept_key, HandshakeRequest, Negotiator};
#[allow(unused_imports)]
pub use lifecycle::{ConnectionState, LifecycleEvent, TransitionError};
#[allow(unused_imports)]
pub use registry::{ConnectionHandle, ConnectionId, Registry};
pub use websocket::WebSocketServer;
