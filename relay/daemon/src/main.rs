//! Relay Daemon - Chat Stream Passthrough and Monitor Server
//!
//! Accepts Ollama-style `/api/chat` requests, forwards them to the backend,
//! and streams the response back while keeping it observable: any number of
//! monitor clients can attach to a response by id, mid-stream or after it
//! finished.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (listens on 127.0.0.1:11435, backend localhost:11434)
//! relay-daemon
//!
//! # Custom listen address and backend
//! relay-daemon --listen 0.0.0.0:8080 --backend-host gpu-box
//!
//! # With config file
//! relay-daemon --config /etc/chat-relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod backend;
mod server;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::{load_config, load_config_from_path, ConfigOverrides, ResponseRegistry};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use backend::OllamaBackend;
use server::AppState;

/// Relay Daemon - Chat stream passthrough with live monitoring
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (overrides config and RELAY_LISTEN_ADDR)
    #[arg(short = 'L', long = "listen", value_name = "ADDR")]
    listen_addr: Option<String>,

    /// Backend host (overrides config and OLLAMA_HOST)
    #[arg(long, value_name = "HOST")]
    backend_host: Option<String>,

    /// Backend port (overrides config and OLLAMA_PORT)
    #[arg(long, value_name = "PORT")]
    backend_port: Option<u16>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref addr) = self.listen_addr {
            overrides = overrides.with_listen_addr(addr.clone());
        }
        if let Some(ref host) = self.backend_host {
            overrides = overrides.with_backend_host(host.clone());
        }
        if let Some(port) = self.backend_port {
            overrides = overrides.with_backend_port(port);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration: file and environment, then CLI on top
    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides().apply(&mut config);

    info!(
        source = %config.source(),
        listen_addr = %config.listen_addr,
        backend = %format!("{}:{}", config.backend_host, config.backend_port),
        max_entries = config.registry.max_entries,
        queue_capacity = config.multiplexer.subscriber_queue_capacity,
        "Configuration loaded"
    );

    let backend = OllamaBackend::from_config(&config).context("Failed to create backend client")?;
    let registry = ResponseRegistry::new(config.registry.clone());
    let sweeper = registry.start_sweeper();

    let state = AppState {
        registry,
        backend,
        mux_config: config.multiplexer.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening");

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
    };

    let result = axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutting down...");
    sweeper.stop().await;

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server stopped with error");
            Err(e.into())
        }
    }
}
