//! Per-connection task
//!
//! Drives one upgraded connection through its lifecycle: registers it when it
//! opens, answers pings, hands text frames to the dispatcher, writes queued
//! broadcasts, and deregisters it when it closes or fails. This task is the
//! only writer to its socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};

use super::codec::{CloseReason, Frame, FrameTransport};
use super::dispatch::Dispatcher;
use super::error::{ConnectionError, DispatchError};
use super::lifecycle::{ConnectionState, LifecycleEvent};
use super::registry::{ConnectionHandle, ConnectionId, Registry};
use crate::config::ServerConfig;

/// Close code sent when the server shuts down
const CLOSE_GOING_AWAY: u16 = 1001;

/// State shared by every connection task of one server
pub struct ConnectionContext {
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub outbound_capacity: usize,
    pub close_timeout: Duration,
    config: ServerConfig,
}

impl ConnectionContext {
    pub fn new(config: &ServerConfig, registry: Arc<Registry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(
                Arc::clone(&registry),
                config.tag.clone(),
                config.max_frame_size,
            ),
            registry,
            outbound_capacity: config.outbound_capacity,
            close_timeout: config.close_timeout(),
            config: config.clone(),
        }
    }

    fn welcome_for(&self, id: ConnectionId) -> Option<String> {
        self.config.welcome_for(id)
    }
}

/// How the read loop ended without an error
enum Ending {
    /// Peer went away without a closing handshake
    Disconnected,
    /// Peer sent Close
    CloseReceived(Option<CloseReason>),
    /// Server is shutting down
    Shutdown,
}

/// An OPEN connection and everything its task owns
pub struct Connection<T> {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    transport: T,
    outbound: mpsc::Receiver<Arc<str>>,
    evict: Arc<Notify>,
    ctx: Arc<ConnectionContext>,
}

impl<T: FrameTransport> Connection<T> {
    /// Complete the CONNECTING -> OPEN transition and register the connection
    pub async fn open(
        id: ConnectionId,
        peer: SocketAddr,
        transport: T,
        ctx: Arc<ConnectionContext>,
    ) -> Result<Self, ConnectionError> {
        let state = ConnectionState::Connecting.apply(LifecycleEvent::HandshakeAccepted)?;
        let (tx, outbound) = mpsc::channel(ctx.outbound_capacity);
        let evict = Arc::new(Notify::new());

        ctx.registry
            .add(ConnectionHandle::new(id, tx, Arc::clone(&evict)))
            .await;
        info!("Connection {} from {} is open", id, peer);

        Ok(Self {
            id,
            peer,
            state,
            transport,
            outbound,
            evict,
            ctx,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until the connection is CLOSED or ERRORED; returns the final state
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> ConnectionState {
        let result = match self.serve(&mut shutdown_rx).await {
            Ok(ending) => self.finish(ending).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.fail(e).await;
        }

        // Removal is idempotent; covers paths that never left OPEN cleanly
        self.ctx.registry.remove(self.id).await;
        info!(
            "Connection {} from {} finished in state {}",
            self.id, self.peer, self.state
        );
        self.state
    }

    async fn serve(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Ending, ConnectionError> {
        if let Some(welcome) = self.ctx.welcome_for(self.id) {
            self.transport.send(Frame::Text(welcome)).await?;
        }

        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if let Some(ending) = self.on_frame(frame).await? {
                                return Ok(ending);
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(Ending::Disconnected),
                    }
                }
                Some(message) = self.outbound.recv() => {
                    self.transport.send(Frame::Text(message.to_string())).await?;
                }
                _ = self.evict.notified() => {
                    return Err(DispatchError::QueueFull.into());
                }
                _ = shutdown_rx.recv() => {
                    return Ok(Ending::Shutdown);
                }
            }
        }
    }

    /// Handle one inbound frame; `Some` ends the read loop
    async fn on_frame(&mut self, frame: Frame) -> Result<Option<Ending>, ConnectionError> {
        match frame {
            Frame::Text(text) => {
                debug!("Received message from {}: {}", self.id, text);
                self.ctx.dispatcher.broadcast(self.id, &text).await?;
                Ok(None)
            }
            Frame::Ping(payload) => {
                self.transport.send(Frame::Pong(payload)).await?;
                Ok(None)
            }
            Frame::Pong(_) => Ok(None),
            Frame::Close(reason) => Ok(Some(Ending::CloseReceived(reason))),
        }
    }

    /// Closing handshake for a loop that ended without error
    async fn finish(&mut self, ending: Ending) -> Result<(), ConnectionError> {
        match ending {
            Ending::Disconnected => {
                info!("Connection {} closed by {}", self.id, self.peer);
            }
            Ending::CloseReceived(reason) => {
                info!("Client {} requested close", self.id);
                self.transition(LifecycleEvent::CloseReceived).await?;
                self.transport.send(Frame::Close(reason)).await?;
                self.await_close().await;
            }
            Ending::Shutdown => {
                info!("Shutdown signal received, closing connection {}", self.id);
                self.transition(LifecycleEvent::CloseSent).await?;
                self.transport
                    .send(Frame::Close(Some(CloseReason::new(
                        CLOSE_GOING_AWAY,
                        "server shutting down",
                    ))))
                    .await?;
                self.await_close().await;
            }
        }
        self.transition(LifecycleEvent::SocketClosed).await
    }

    /// Drain the transport until the peer completes the closing handshake
    async fn await_close(&mut self) {
        let timeout = self.ctx.close_timeout;
        let drain = async {
            while let Some(frame) = self.transport.recv().await {
                match frame {
                    Ok(Frame::Close(_)) => debug!("Connection {} close acknowledged", self.id),
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Connection {} errored while closing: {}", self.id, e);
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                "Connection {} did not finish the closing handshake within {:?}",
                self.id, timeout
            );
        }
    }

    /// Any state -> ERRORED: log, tell the peer when possible, deregister
    async fn fail(&mut self, err: ConnectionError) {
        match &err {
            ConnectionError::Protocol(_) | ConnectionError::Dispatch(_) => {
                warn!("Connection {} from {} failed: {}", self.id, self.peer, err);
            }
            _ => error!("Connection {} from {} failed: {}", self.id, self.peer, err),
        }

        if let Err(e) = self.transition(LifecycleEvent::Failed).await {
            debug!("Connection {}: {}", self.id, e);
        }

        if let Some(code) = err.close_code() {
            let close = Frame::Close(Some(CloseReason::new(code, err.to_string())));
            match tokio::time::timeout(self.ctx.close_timeout, self.transport.send(close)).await {
                Ok(Err(e)) => debug!("Connection {}: close frame not sent: {}", self.id, e),
                Err(_) => debug!("Connection {}: close frame timed out", self.id),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Apply a lifecycle event, deregistering on the way out of OPEN
    async fn transition(&mut self, event: LifecycleEvent) -> Result<(), ConnectionError> {
        let next = self.state.apply(event)?;
        debug!("Connection {}: {} -> {}", self.id, self.state, next);

        let was_registered = self.state.is_registered();
        self.state = next;
        if was_registered && !next.is_registered() {
            self.ctx.registry.remove(self.id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::codec::{CodecConfig, TungsteniteTransport};
    use crate::server::error::ProtocolError;
    use futures_util::{SinkExt, StreamExt};
    use std::io;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type Inbound = Option<Result<Frame, ConnectionError>>;

    /// Transport fed from a channel that records everything sent
    struct ScriptedTransport {
        inbound: mpsc::UnboundedReceiver<Inbound>,
        sent: mpsc::UnboundedSender<Frame>,
        fail_sends: bool,
    }

    impl FrameTransport for ScriptedTransport {
        async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
            self.inbound.recv().await.flatten()
        }

        async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
            if self.fail_sends {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
            }
            let _ = self.sent.send(frame);
            Ok(())
        }
    }

    struct Harness {
        inbound: mpsc::UnboundedSender<Inbound>,
        sent: mpsc::UnboundedReceiver<Frame>,
        ctx: Arc<ConnectionContext>,
        shutdown_tx: broadcast::Sender<()>,
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn context(welcome: Option<String>) -> Arc<ConnectionContext> {
        let config = ServerConfig::default().with_tag("t").with_welcome(welcome);
        let config = ServerConfig {
            close_timeout_ms: 200,
            ..config
        };
        Arc::new(ConnectionContext::new(&config, Arc::new(Registry::new())))
    }

    async fn open(
        ctx: Arc<ConnectionContext>,
        fail_sends: bool,
    ) -> (Connection<ScriptedTransport>, Harness) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let transport = ScriptedTransport {
            inbound: inbound_rx,
            sent: sent_tx,
            fail_sends,
        };
        let id = ctx.registry.allocate_id();
        let connection = Connection::open(id, peer(), transport, Arc::clone(&ctx))
            .await
            .unwrap();
        let harness = Harness {
            inbound: inbound_tx,
            sent: sent_rx,
            ctx,
            shutdown_tx,
        };
        (connection, harness)
    }

    async fn open_tungstenite(
        ctx: &Arc<ConnectionContext>,
    ) -> (
        Connection<TungsteniteTransport<DuplexStream>>,
        WebSocketStream<DuplexStream>,
    ) {
        let (client_io, server_io) = duplex(64 * 1024);
        let transport =
            TungsteniteTransport::upgrade(server_io, Vec::new(), CodecConfig::new(1024)).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let id = ctx.registry.allocate_id();
        let connection = Connection::open(id, peer(), transport, Arc::clone(ctx))
            .await
            .unwrap();
        (connection, client)
    }

    #[tokio::test]
    async fn test_open_registers() {
        let (connection, harness) = open(context(None), false).await;
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(harness.ctx.registry.contains(connection.id()).await);
    }

    #[tokio::test]
    async fn test_welcome_then_ping_pong() {
        let (connection, mut harness) = open(context(Some("hello {id}".into())), false).await;
        let id = connection.id();
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));

        harness
            .inbound
            .send(Some(Ok(Frame::Ping(vec![1, 2, 3]))))
            .unwrap();
        harness.inbound.send(None).unwrap();

        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(
            harness.sent.recv().await,
            Some(Frame::Text(format!("hello {id}")))
        );
        assert_eq!(harness.sent.recv().await, Some(Frame::Pong(vec![1, 2, 3])));
        assert!(harness.sent.recv().await.is_none());
        assert!(harness.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_text_is_broadcast_back_to_sender() {
        let (connection, mut harness) = open(context(None), false).await;
        let id = connection.id();
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));

        harness
            .inbound
            .send(Some(Ok(Frame::Text("hi".into()))))
            .unwrap();
        assert_eq!(
            harness.sent.recv().await,
            Some(Frame::Text(format!("[t] {id}：hi")))
        );

        harness.inbound.send(None).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_echoed_and_deregistered() {
        let (connection, mut harness) = open(context(None), false).await;
        let id = connection.id();
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));

        let reason = CloseReason::new(1000, "bye");
        harness
            .inbound
            .send(Some(Ok(Frame::Close(Some(reason.clone())))))
            .unwrap();
        assert_eq!(harness.sent.recv().await, Some(Frame::Close(Some(reason))));
        assert!(!harness.ctx.registry.contains(id).await);

        harness.inbound.send(None).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_protocol_error_closes_with_code() {
        let (connection, mut harness) = open(context(None), false).await;
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));

        harness
            .inbound
            .send(Some(Err(ProtocolError::UnsupportedFrame("binary").into())))
            .unwrap();

        assert_eq!(task.await.unwrap(), ConnectionState::Errored);
        match harness.sent.recv().await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, 1003),
            other => panic!("Expected close frame, got {other:?}"),
        }
        assert!(harness.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_write_failure_errors_connection() {
        let (connection, harness) = open(context(Some("hi".into())), true).await;
        let state = connection.run(harness.shutdown_tx.subscribe()).await;
        assert_eq!(state, ConnectionState::Errored);
        assert!(harness.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_eviction_errors_connection() {
        let (connection, harness) = open(context(None), false).await;
        let handle = harness.ctx.registry.snapshot().await.pop().unwrap();
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));

        handle.evict();
        assert_eq!(task.await.unwrap(), ConnectionState::Errored);
        assert!(harness.ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let (connection, mut harness) = open(context(None), false).await;
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));
        tokio::task::yield_now().await;

        harness.shutdown_tx.send(()).unwrap();
        match harness.sent.recv().await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, CLOSE_GOING_AWAY),
            other => panic!("Expected close frame, got {other:?}"),
        }

        harness.inbound.send(Some(Ok(Frame::Close(None)))).unwrap();
        harness.inbound.send(None).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unanswered_close_times_out() {
        let (connection, mut harness) = open(context(None), false).await;
        let task = tokio::spawn(connection.run(harness.shutdown_tx.subscribe()));
        tokio::task::yield_now().await;

        harness.shutdown_tx.send(()).unwrap();
        assert!(matches!(harness.sent.recv().await, Some(Frame::Close(_))));
        // Peer never answers; close_timeout is 200ms
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        drop(harness.inbound);
    }

    #[tokio::test]
    async fn test_peer_close_over_tungstenite_ends_closed() {
        let ctx = context(None);
        let (connection, mut client) = open_tungstenite(&ctx).await;
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(connection.run(shutdown_tx.subscribe()));

        client.send(Message::Close(None)).await.unwrap();
        match client.next().await {
            Some(Ok(Message::Close(_))) => {}
            other => panic!("Expected close echo, got {other:?}"),
        }

        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert!(ctx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_over_tungstenite_ends_closed() {
        let ctx = context(None);
        let (connection, mut client) = open_tungstenite(&ctx).await;
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = tokio::spawn(connection.run(shutdown_tx.subscribe()));

        // Reading keeps the client answering the server's Close
        let reader = tokio::spawn(async move {
            let mut codes = Vec::new();
            while let Some(Ok(message)) = client.next().await {
                if let Message::Close(Some(frame)) = message {
                    codes.push(u16::from(frame.code));
                }
            }
            codes
        });

        shutdown_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(reader.await.unwrap(), vec![CLOSE_GOING_AWAY]);
    }
}
