//! Demo backend for driving failure scenarios by hand.
//!
//! - `GET /health` answers 200 while healthy, 500 while failing
//! - `POST /toggle` (or GET) flips between the two
//! - every other path echoes method, path and backend name, or 500 while
//!   failing

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    routing::{any, get},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "demo-backend")]
#[command(about = "Toggleable backend for exercising the resilient proxy", long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    /// Name echoed in every response.
    #[arg(short, long)]
    name: Option<String>,

    /// Start in the failing state.
    #[arg(long)]
    failing: bool,
}

struct DemoState {
    name: String,
    healthy: AtomicBool,
    served: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let state = Arc::new(DemoState {
        name: args.name.unwrap_or_else(|| format!("backend-{}", args.port)),
        healthy: AtomicBool::new(!args.failing),
        served: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/toggle", any(toggle))
        .fallback(echo)
        .with_state(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, name = %state.name, "Demo backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<Arc<DemoState>>) -> (StatusCode, &'static str) {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "unhealthy")
    }
}

async fn toggle(State(state): State<Arc<DemoState>>) -> Json<serde_json::Value> {
    let healthy = !state.healthy.fetch_xor(true, Ordering::SeqCst);
    tracing::info!(name = %state.name, healthy, "Health toggled");
    Json(json!({ "name": state.name, "healthy": healthy }))
}

async fn echo(
    State(state): State<Arc<DemoState>>,
    method: Method,
    uri: Uri,
) -> (StatusCode, Json<serde_json::Value>) {
    let served = state.served.fetch_add(1, Ordering::Relaxed) + 1;
    if !state.healthy.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "name": state.name, "error": "failing" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "name": state.name,
            "method": method.as_str(),
            "path": uri.path(),
            "served": served,
        })),
    )
}
