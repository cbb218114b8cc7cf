//! WebSocket server implementation
//!
//! Binds the listener and hands every accepted socket to its own task, which
//! runs the handshake and then the connection lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::codec::{CodecConfig, TungsteniteTransport};
use super::connection::{Connection, ConnectionContext};
use super::error::HandshakeError;
use super::handshake::Negotiator;
use super::lifecycle::{ConnectionState, LifecycleEvent};
use super::registry::{ConnectionId, Registry};
use crate::config::ServerConfig;

/// WebSocket broadcast server
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Everything a connection task needs besides its socket
struct Pipeline {
    negotiator: Negotiator,
    codec: CodecConfig,
    ctx: Arc<ConnectionContext>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(Registry::new());
        let ctx = Arc::new(ConnectionContext::new(&config, Arc::clone(&registry)));
        // Broadcasts carry a prefix on top of a text that may already be at the limit
        let codec = CodecConfig::new(config.max_frame_size)
            .with_max_outbound_size(ctx.dispatcher.max_message_size());
        let pipeline = Arc::new(Pipeline {
            negotiator: Negotiator::new(config.path.clone(), config.max_header_size),
            codec,
            ctx,
        });
        Self {
            config,
            registry,
            pipeline,
            shutdown_tx,
        }
    }

    /// Registry of open connections
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// A bind failure is returned to the caller; per-connection failures never are.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(
            "WebSocket server listening on ws://{}{}",
            local,
            self.config.path.as_deref().unwrap_or("/")
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let id = self.registry.allocate_id();
                            let pipeline = Arc::clone(&self.pipeline);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tasks.spawn(handle_connection(stream, peer_addr, id, pipeline, shutdown_rx));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(listener);

        // Wait for active connections to finish their closing handshakes
        if !tasks.is_empty() {
            info!("Waiting for {} connections to close...", tasks.len());
        }
        let grace = self.config.close_timeout() * 2;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connections that did not close in time", tasks.len());
            tasks.shutdown().await;
        }

        Ok(())
    }
}

/// Handle a single accepted socket from handshake to teardown
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    id: ConnectionId,
    pipeline: Arc<Pipeline>,
    shutdown_rx: broadcast::Receiver<()>,
) -> ConnectionState {
    debug!("New connection {} from {}", id, peer_addr);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let mut stream = stream;
    let state = ConnectionState::Connecting;
    let upgrade = match pipeline.negotiator.accept(&mut stream).await {
        Ok(upgrade) => upgrade,
        Err(e) => {
            let event = match &e {
                HandshakeError::Io(_) => {
                    error!("Handshake with {} failed: {}", peer_addr, e);
                    LifecycleEvent::Failed
                }
                HandshakeError::Disconnected => {
                    debug!("{} disconnected before upgrading", peer_addr);
                    LifecycleEvent::SocketClosed
                }
                _ => {
                    info!("Rejected upgrade from {}: {}", peer_addr, e);
                    LifecycleEvent::HandshakeRejected
                }
            };
            return state.apply(event).unwrap_or(state);
        }
    };
    debug!("Upgraded connection {} on {}", id, upgrade.request.path());

    let transport = TungsteniteTransport::upgrade(stream, upgrade.leftover, pipeline.codec).await;
    match Connection::open(id, peer_addr, transport, Arc::clone(&pipeline.ctx)).await {
        Ok(connection) => connection.run(shutdown_rx).await,
        Err(e) => {
            error!("Failed to open connection {}: {}", id, e);
            ConnectionState::Errored
        }
    }
}
