//! Shadow traffic proxy.
//!
//! ```text
//!                        ┌──────────────────────────────────────────────┐
//!                        │                SHADOW PROXY                  │
//!   Client Request       │  ┌──────────┐    ┌─────────┐   ┌──────────┐  │
//!   ─────────────────────┼─▶│  http    │───▶│duplicate│──▶│ primary  │──┼──▶ Primary
//!                        │  │  server  │    │  body   │   └────┬─────┘  │
//!                        │  └──────────┘    │         │   ┌──────────┐  │
//!                        │                  │         │──▶│  shadow  │──┼──▶ Shadow
//!                        │                  └─────────┘   └────┬─────┘  │
//!   Client Response      │                                     ▼        │
//!   ◀────────────────────┼────── primary response ◀──── compare, log,   │
//!                        │                              count           │
//!                        └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use shadow_proxy::config::{load_config, ConfigWatcher, ProxyConfig};
use shadow_proxy::observability::{logging, metrics};
use shadow_proxy::{HttpServer, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "shadow-proxy", version, about = "Shadow traffic proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "shadow-proxy.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Do not reload the configuration when the file changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (config, loaded) = match load_config(&cli.config) {
        Ok(config) => (config, true),
        Err(shadow_proxy::config::ConfigError::Io(e)) if !cli.check => {
            eprintln!("cannot read {}: {e}; using defaults", cli.config.display());
            (ProxyConfig::default(), false)
        }
        Err(e) => return Err(e.into()),
    };

    if cli.check {
        println!("{}: ok", cli.config.display());
        return Ok(());
    }

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "shadow-proxy starting");
    if !loaded {
        tracing::warn!(path = ?cli.config, "Configuration file not loaded, running with defaults");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        timeout = %config.shadow.timeout,
        compare_status = config.shadow.compare_status,
        compare_body = config.shadow.compare_body,
        "Configuration loaded"
    );

    let server = HttpServer::new(config.clone())?;

    // Keep the watcher alive for the lifetime of the server.
    let (updates, _watcher) = if loaded && !cli.no_watch {
        let (watcher, updates) = ConfigWatcher::new(&cli.config);
        (updates, Some(watcher.run()?))
    } else {
        let (_tx, updates) = mpsc::unbounded_channel();
        (updates, None)
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    server.run(listener, updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
