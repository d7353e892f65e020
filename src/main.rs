//! Resilient Reverse Proxy
//!
//! A reverse proxy that keeps traffic away from slow or failing backends,
//! built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                              ┌────────────────────────────────────────────────────────┐
//!                              │                   RESILIENT PROXY                      │
//!                              │                                                        │
//!     Client Request           │  ┌─────────┐    ┌────────────┐    ┌──────────────┐     │
//!     ─────────────────────────┼─▶│  http   │───▶│ rate limit │───▶│  dispatcher  │     │
//!                              │  │ server  │    │ (optional) │    │ round robin  │     │
//!                              │  └─────────┘    └────────────┘    └──────┬───────┘     │
//!                              │                                          │             │
//!                              │                                          ▼             │
//!                              │                                  ┌──────────────┐      │
//!                              │                                  │   circuit    │      │
//!                              │                                  │   breaker    │      │
//!                              │                                  └──────┬───────┘      │
//!                              │                                         │              │
//!     Client Response          │  ┌─────────┐    ┌──────────────┐  ┌─────▼──────┐       │
//!     ◀────────────────────────┼──│response │◀───│ passive      │◀─│  forward   │◀──────┼──── Backend
//!                              │  │ mapping │    │ monitor      │  │ (hyper)    │       │     Server
//!                              │  └─────────┘    └──────────────┘  └────────────┘       │
//!                              │                                                        │
//!                              │  ┌───────────────┐  ┌───────────┐  ┌────────────────┐  │
//!                              │  │ active prober │  │ admin API │  │ observability  │  │
//!                              │  └───────────────┘  └───────────┘  └────────────────┘  │
//!                              └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use resilient_proxy::config::loader::{load_with_overrides, Overrides};
use resilient_proxy::lifecycle::signals::spawn_signal_handler;
use resilient_proxy::observability::{logging, metrics};
use resilient_proxy::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "resilient-proxy", version)]
#[command(about = "Reverse proxy with circuit breaking and health checking", long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener address, overrides `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Comma-separated backend URLs, replaces the configured backends.
    #[arg(long)]
    backends: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let overrides = Overrides {
        bind_address: args.bind,
        backends: args.backends,
    };
    let config = load_with_overrides(args.config.as_deref(), &overrides)?;

    logging::init_logging(&config.observability);
    tracing::info!("resilient-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = config.backends.len(),
        probe_interval_ms = config.health_check.interval_ms,
        open_timeout_ms = config.circuit_breaker.open_timeout_ms,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    spawn_signal_handler(shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, rx).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
