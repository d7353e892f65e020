//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all proxy handler
//! - Wire up middleware (request ID, tracing, panic capture, rate limit)
//! - Build the backend pool, passive monitor and dispatcher from config
//! - Run the active prober and the admin listener next to the proxy
//! - Shut everything down on the broadcast signal
//! - Observability (metrics, correlation IDs)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin::{setup_admin_router, AdminState};
use crate::config::ProxyConfig;
use crate::health::active::ActiveProber;
use crate::health::passive::PassiveMonitor;
use crate::http::forward::{ClientAddr, HttpForwarder};
use crate::http::request::{request_id, MakeRequestUuid};
use crate::lifecycle::shutdown;
use crate::load_balancer::backend::{BackendError, BackendId};
use crate::load_balancer::dispatcher::Dispatcher;
use crate::load_balancer::pool::{BackendPool, ProxyHooks};
use crate::observability::metrics;
use crate::security::rate_limit::{self, rate_limit_middleware, AdmissionControl};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// HTTP server for the resilient proxy.
pub struct HttpServer {
    config: ProxyConfig,
    pool: Arc<BackendPool>,
    passive: Arc<PassiveMonitor>,
    dispatcher: Arc<Dispatcher>,
    limiter: Option<Arc<dyn AdmissionControl>>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        Self::with_hooks(config, ProxyHooks::default())
    }

    /// Like [`new`](Self::new), with a custom trip predicate and/or
    /// breaker state-change observer.
    pub fn with_hooks(config: ProxyConfig, hooks: ProxyHooks) -> Result<Self, ServerError> {
        let pool = Arc::new(BackendPool::from_config(&config, &hooks)?);
        let passive = Arc::new(PassiveMonitor::new(pool.backends(), &config.passive));
        let forwarder = HttpForwarder::new(&config.timeouts);
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), passive.clone(), forwarder));
        let limiter = rate_limit::from_config(&config.rate_limit);

        Ok(Self {
            config,
            pool,
            passive,
            dispatcher,
            limiter,
        })
    }

    /// Replace the configured admission control.
    pub fn with_admission(mut self, limiter: Arc<dyn AdmissionControl>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
        };

        let mut router = Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state);

        if let Some(limiter) = &self.limiter {
            router = router.layer(middleware::from_fn_with_state(
                limiter.clone(),
                rate_limit_middleware,
            ));
        }

        router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id(request),
                )
            }))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server until `shutdown` fires.
    ///
    /// The active prober and the admin listener (when enabled) run for the
    /// same lifetime and are stopped before this returns.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            backends = self.pool.len(),
            "HTTP server starting"
        );

        let prober = self.config.health_check.enabled.then(|| {
            ActiveProber::new(self.pool.backends(), &self.config.health_check).spawn()
        });

        let admin = if self.config.admin.enabled {
            let address = self.config.admin.bind_address.clone();
            let admin_listener = TcpListener::bind(&address)
                .await
                .map_err(|source| ServerError::Bind { address, source })?;
            let state = AdminState::new(
                self.pool.clone(),
                self.passive.clone(),
                &self.config.admin.api_key,
            );
            tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
            let stop = shutdown.resubscribe();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, setup_admin_router(state))
                    .with_graceful_shutdown(shutdown::wait(stop))
                    .await
            }))
        } else {
            None
        };

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown::wait(shutdown))
            .await;

        if let Some(prober) = prober {
            prober.stop().await;
        }
        if let Some(admin) = admin {
            match admin.await {
                Ok(Err(e)) => tracing::error!(error = %e, "Admin server failed"),
                Err(e) => tracing::error!(error = %e, "Admin server task failed"),
                Ok(Ok(())) => {}
            }
        }

        served?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Main proxy handler.
/// Selects a backend and forwards the request through its breaker.
async fn proxy_handler(State(state): State<AppState>, mut request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let request_id = request_id(&request).to_string();

    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>().copied() {
        request.extensions_mut().insert(ClientAddr(peer));
    }

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %request.uri().path(),
        "Proxying request"
    );

    match state.dispatcher.handle(request).await {
        Ok(response) => {
            let backend = response
                .extensions()
                .get::<BackendId>()
                .and_then(|id| state.dispatcher.pool().get(*id))
                .map(|u| u.backend.url().to_string())
                .unwrap_or_else(|| "none".to_string());
            metrics::record_request(&method, response.status().as_u16(), &backend, start);
            response
        }
        Err(err) => {
            let status = err.status_code();
            tracing::warn!(
                request_id = %request_id,
                kind = err.kind(),
                error = %err,
                "Dispatch failed"
            );
            metrics::record_rejection(err.kind());
            metrics::record_request(&method, status.as_u16(), "none", start);
            err.into_response()
        }
    }
}
