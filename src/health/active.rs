//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend's liveness endpoint
//! - Write the result as the backend's active health signal
//!
//! # Design Decisions
//! - First round runs immediately, then one round per interval
//! - Probes within a round run concurrently; the round waits for all
//! - Stop waits for the in-flight round, so no write happens afterwards

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use futures_util::future::join_all;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::state::{HealthSource, HealthStatus};
use crate::load_balancer::backend::Backend;

/// Why a probe classified a backend as unhealthy. Logged, never returned
/// to callers.
#[derive(Debug, thiserror::Error)]
enum ProbeFailed {
    #[error("invalid probe uri: {0}")]
    InvalidUri(String),
    #[error("non-success status {0}")]
    Status(StatusCode),
    #[error("connection error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

struct ProbeTarget {
    backend: Arc<Backend>,
    uri: Result<Uri, String>,
}

/// Timer-driven liveness prober.
pub struct ActiveProber {
    targets: Vec<ProbeTarget>,
    interval: Duration,
    timeout: Duration,
    client: Client<HttpConnector, Body>,
}

impl ActiveProber {
    pub fn new(backends: Vec<Arc<Backend>>, config: &HealthCheckConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_millis(config.timeout_ms)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let targets = backends
            .into_iter()
            .map(|backend| {
                let uri = probe_uri(&backend, &config.path);
                ProbeTarget { backend, uri }
            })
            .collect();

        Self {
            targets,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            client,
        }
    }

    /// Start the probe loop on its own task.
    pub fn spawn(self) -> ProberHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        ProberHandle { stop_tx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            backends = self.targets.len(),
            "Active prober starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                _ = stop.changed() => {
                    tracing::info!("Active prober received stop signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every backend once, concurrently.
    pub async fn probe_all(&self) {
        join_all(self.targets.iter().map(|target| self.probe(target))).await;
    }

    async fn probe(&self, target: &ProbeTarget) {
        let status = match self.check(target).await {
            Ok(()) => HealthStatus::Healthy,
            Err(reason) => {
                tracing::warn!(backend = %target.backend.url(), %reason, "Health probe failed");
                HealthStatus::Unhealthy
            }
        };
        target.backend.mark(HealthSource::Active, status);
    }

    async fn check(&self, target: &ProbeTarget) -> Result<(), ProbeFailed> {
        let uri = target.uri.clone().map_err(ProbeFailed::InvalidUri)?;
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "resilient-proxy-health-check")
            .body(Body::empty())
            .map_err(|e| ProbeFailed::InvalidUri(e.to_string()))?;

        match time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if (200..400).contains(&status.as_u16()) {
                    Ok(())
                } else {
                    Err(ProbeFailed::Status(status))
                }
            }
            Ok(Err(e)) => Err(ProbeFailed::Transport(e.to_string())),
            Err(_) => Err(ProbeFailed::Timeout(self.timeout)),
        }
    }
}

/// Handle to a running prober.
#[derive(Debug)]
pub struct ProberHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProberHandle {
    /// Stop the loop and wait for any in-flight round to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Active prober task failed");
        }
        tracing::info!("Active prober stopped");
    }
}

fn probe_uri(backend: &Backend, path: &str) -> Result<Uri, String> {
    let base = backend.url().as_str().trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Uri::from_str(&format!("{base}{path}")).map_err(|e| e.to_string())
}
