//! WebSocket broadcast server
//!
//! Every text message a client sends is relayed to every connected client,
//! the sender included, tagged with the sender's connection id.

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::ServerConfig;
use server::WebSocketServer;

/// WebSocket broadcast server
///
/// Relays every text message to every connected client
#[derive(Parser, Debug)]
#[command(name = "ws-broadcast")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on [default: 9000]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 127.0.0.1]
    #[arg(long)]
    bind: Option<String>,

    /// Only accept upgrades on this path
    #[arg(long)]
    path: Option<String>,

    /// Tag prefixed to broadcast messages
    #[arg(long)]
    tag: Option<String>,

    /// Text sent to each new connection ("{id}" is replaced, empty disables)
    #[arg(long)]
    welcome: Option<String>,

    /// Maximum text frame size in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.path.is_some() {
            config = config.with_path(self.path);
        }
        if let Some(tag) = self.tag {
            config = config.with_tag(tag);
        }
        if self.welcome.is_some() {
            config = config.with_welcome(self.welcome);
        }
        if let Some(max) = self.max_frame_size {
            config = config.with_max_frame_size(max);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("ws-broadcast v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server; a bind failure ends the process with an error
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
