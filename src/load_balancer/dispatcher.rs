//! Resilient dispatch.
//!
//! # Data Flow
//! ```text
//! handle(request)
//!     → select(): first usable upstream from the cursor
//!     → breaker.execute_catching(forward)
//!     → outcome → passive monitor
//!     → response, relayed 5xx, or DispatchError
//! ```
//!
//! # Design Decisions
//! - Breaker rejections, transport failures and 5xx all feed the passive
//!   monitor as failures
//! - A relayed 5xx is still a breaker failure
//! - A panic in the forward is recorded by the breaker and the monitor,
//!   then resumed unchanged

use std::panic;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};

use crate::health::passive::PassiveMonitor;
use crate::http::forward::{ForwardError, Forwarder, HttpForwarder};
use crate::load_balancer::backend::BackendId;
use crate::load_balancer::pool::{BackendPool, Upstream};
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::LoadBalancer;
use crate::resilience::circuit_breaker::BreakerError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },
    #[error("too many half-open requests for backend {backend}")]
    TooManyRequests { backend: String },
    #[error("no healthy backend available")]
    NoHealthyBackend,
    #[error("forwarding to {backend} failed: {source}")]
    ForwardFailed {
        backend: String,
        #[source]
        source: ForwardError,
    },
}

impl DispatchError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::TooManyRequests { .. } => "too_many_requests",
            DispatchError::NoHealthyBackend => "no_healthy_backend",
            DispatchError::ForwardFailed { .. } => "forward_failed",
        }
    }
}

/// Selects a usable backend and forwards through its breaker.
pub struct Dispatcher<F = HttpForwarder> {
    pool: Arc<BackendPool>,
    passive: Arc<PassiveMonitor>,
    balancer: Box<dyn LoadBalancer>,
    forwarder: F,
}

impl<F: Forwarder> Dispatcher<F> {
    pub fn new(pool: Arc<BackendPool>, passive: Arc<PassiveMonitor>, forwarder: F) -> Self {
        Self {
            pool,
            passive,
            balancer: Box::new(RoundRobin::new()),
            forwarder,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn passive(&self) -> &Arc<PassiveMonitor> {
        &self.passive
    }

    /// Next usable upstream in rotation order.
    pub fn select(&self) -> Result<&Upstream, DispatchError> {
        let upstreams = self.pool.upstreams();
        self.balancer
            .next_index(upstreams.len(), &|i| upstreams[i].is_usable())
            .map(|i| &upstreams[i])
            .ok_or(DispatchError::NoHealthyBackend)
    }

    /// Forward `request` to the next usable backend.
    ///
    /// A backend 5xx is returned as `Ok` so it reaches the client unchanged.
    /// Responses carry the serving `BackendId` as an extension.
    pub async fn handle(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let upstream = self.select()?;
        let backend = &upstream.backend;
        let id = backend.id();

        tracing::debug!(backend = %backend.url(), "Dispatching request");

        let pending = PendingOutcome {
            passive: &self.passive,
            id,
            settled: false,
        };
        let outcome = upstream
            .breaker
            .execute_catching(|| self.forwarder.forward(request, backend))
            .await;
        pending.settle();

        match outcome {
            Ok(mut response) => {
                self.passive.record_success(id);
                response.extensions_mut().insert(id);
                Ok(response)
            }
            Err(BreakerError::Operation(ForwardError::ServerError(response))) => {
                self.passive.record_failure(id);
                tracing::debug!(backend = %backend.url(), status = %response.status(), "Relaying upstream error");
                let mut response = response.into_inner();
                response.extensions_mut().insert(id);
                Ok(response)
            }
            Err(BreakerError::Operation(source)) => {
                self.passive.record_failure(id);
                tracing::warn!(backend = %backend.url(), error = %source, "Upstream request failed");
                Err(DispatchError::ForwardFailed {
                    backend: backend.url().to_string(),
                    source,
                })
            }
            Err(BreakerError::CircuitOpen) => {
                self.passive.record_failure(id);
                Err(DispatchError::CircuitOpen {
                    backend: backend.url().to_string(),
                })
            }
            Err(BreakerError::TooManyRequests) => {
                self.passive.record_failure(id);
                Err(DispatchError::TooManyRequests {
                    backend: backend.url().to_string(),
                })
            }
            Err(BreakerError::Aborted(payload)) => {
                self.passive.record_failure(id);
                tracing::error!(backend = %backend.url(), "Forward panicked");
                panic::resume_unwind(payload)
            }
        }
    }
}

/// A forward in flight. Dropping it unsettled means the caller went away
/// mid-request; the breaker counts that as a failure, and so does the
/// passive monitor.
struct PendingOutcome<'a> {
    passive: &'a PassiveMonitor,
    id: BackendId,
    settled: bool,
}

impl PendingOutcome<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingOutcome<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(backend = %self.id, "Request cancelled in flight");
            self.passive.record_failure(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PassiveHealthConfig, ProxyConfig};
    use crate::health::state::{HealthSource, HealthStatus};
    use crate::load_balancer::backend::Backend;
    use crate::load_balancer::pool::ProxyHooks;
    use crate::resilience::circuit_breaker::{CircuitState, StateTransition};
    use axum::http::StatusCode;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock, Weak};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Reply {
        Status(u16),
        Refused,
        Panic,
        Hang,
    }

    /// Scripted forwarder: one reply per backend index, and a call log.
    struct ScriptedForwarder {
        replies: Mutex<Vec<Reply>>,
        calls: Mutex<Vec<usize>>,
        total: AtomicUsize,
    }

    impl ScriptedForwarder {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
                total: AtomicUsize::new(0),
            }
        }

        fn set(&self, index: usize, reply: Reply) {
            self.replies.lock().unwrap()[index] = reply;
        }
    }

    impl Forwarder for Arc<ScriptedForwarder> {
        async fn forward(&self, _request: Request<Body>, backend: &Backend) -> Result<Response<Body>, ForwardError> {
            let index = backend.id().index();
            self.calls.lock().unwrap().push(index);
            self.total.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap()[index];
            match reply {
                Reply::Status(code) => {
                    let response = Response::builder().status(code).body(Body::from("body")).unwrap();
                    if response.status().is_server_error() {
                        Err(ForwardError::ServerError(crate::http::forward::UpstreamResponse(response)))
                    } else {
                        Ok(response)
                    }
                }
                Reply::Refused => Err(ForwardError::Transport("connection refused".into())),
                Reply::Panic => panic!("forward exploded"),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn dispatcher(
        replies: Vec<Reply>,
        trip_at: u32,
        failure_threshold: u32,
    ) -> (Dispatcher<Arc<ScriptedForwarder>>, Arc<ScriptedForwarder>) {
        dispatcher_with_hooks(replies, trip_at, failure_threshold, &ProxyHooks::default())
    }

    fn dispatcher_with_hooks(
        replies: Vec<Reply>,
        trip_at: u32,
        failure_threshold: u32,
        hooks: &ProxyHooks,
    ) -> (Dispatcher<Arc<ScriptedForwarder>>, Arc<ScriptedForwarder>) {
        let mut config = ProxyConfig {
            backends: (0..replies.len())
                .map(|i| BackendConfig::new(format!("127.0.0.1:{}", 4000 + i)))
                .collect(),
            ..Default::default()
        };
        config.circuit_breaker.trip_consecutive_failures = trip_at;
        config.circuit_breaker.open_timeout_ms = 50;

        let pool = Arc::new(BackendPool::from_config(&config, hooks).unwrap());
        let passive = Arc::new(PassiveMonitor::new(
            pool.backends(),
            &PassiveHealthConfig {
                failure_threshold,
                success_threshold: 2,
            },
        ));
        let forwarder = Arc::new(ScriptedForwarder::new(replies));
        (Dispatcher::new(pool, passive, forwarder.clone()), forwarder)
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn skips_unhealthy_and_open_backends() {
        let (dispatcher, _) = dispatcher(vec![Reply::Status(200); 3], 5, 100);
        let pool = dispatcher.pool().clone();
        pool.upstreams()[0].backend.mark(HealthSource::Active, HealthStatus::Unhealthy);
        pool.upstreams()[2].breaker.trip();

        for _ in 0..3 {
            let selected = dispatcher.select().unwrap();
            assert_eq!(selected.backend.id(), BackendId::new(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_usable_backend_never_forwards() {
        let (dispatcher, forwarder) = dispatcher(vec![Reply::Status(200); 2], 5, 100);
        for upstream in dispatcher.pool().upstreams() {
            upstream.backend.mark(HealthSource::Active, HealthStatus::Unhealthy);
        }

        let err = dispatcher.handle(request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyBackend));
        assert_eq!(forwarder.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_backend_is_isolated_by_its_breaker() {
        let (dispatcher, forwarder) = dispatcher(vec![Reply::Status(200), Reply::Refused], 2, 100);

        // Rotation alternates until backend 1 has failed twice.
        for _ in 0..4 {
            let _ = dispatcher.handle(request()).await;
        }
        let breaker = &dispatcher.pool().upstreams()[1].breaker;
        assert_eq!(breaker.state(), CircuitState::Open);

        forwarder.calls.lock().unwrap().clear();
        for _ in 0..4 {
            let response = dispatcher.handle(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(*forwarder.calls.lock().unwrap(), vec![0, 0, 0, 0]);

        // After the open timeout backend 1 gets one trial and recovers.
        forwarder.set(1, Reply::Status(200));
        tokio::time::sleep(Duration::from_millis(60)).await;
        forwarder.calls.lock().unwrap().clear();
        for _ in 0..2 {
            dispatcher.handle(request()).await.unwrap();
        }
        assert!(forwarder.calls.lock().unwrap().contains(&1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_is_relayed_but_counted() {
        let (dispatcher, _) = dispatcher(vec![Reply::Status(503)], 5, 100);

        let response = dispatcher.handle(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.extensions().get::<BackendId>(), Some(&BackendId::new(0)));

        let upstream = &dispatcher.pool().upstreams()[0];
        assert_eq!(upstream.breaker.counts().consecutive_failures, 1);
        assert_eq!(dispatcher.passive().consecutive_failures(upstream.backend.id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_evict_through_passive_monitor() {
        let (dispatcher, _) = dispatcher(vec![Reply::Refused], 10, 2);

        let err = dispatcher.handle(request()).await.unwrap_err();
        assert_eq!(err.kind(), "forward_failed");
        assert!(dispatcher.pool().upstreams()[0].backend.is_healthy());

        dispatcher.handle(request()).await.unwrap_err();
        assert!(!dispatcher.pool().upstreams()[0].backend.is_healthy());

        let err = dispatcher.handle(request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyBackend));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_excess_is_rejected_and_counted() {
        let (dispatcher, _) = dispatcher(vec![Reply::Status(200)], 5, 100);
        let upstream = &dispatcher.pool().upstreams()[0];
        upstream.breaker.trip();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(upstream.breaker.state(), CircuitState::HalfOpen);

        // Occupy the single trial slot with an operation that never finishes.
        let held = upstream
            .breaker
            .execute(|| std::future::pending::<Result<(), ()>>());
        tokio::pin!(held);
        assert!(futures_util::poll!(held.as_mut()).is_pending());

        let err = dispatcher.handle(request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TooManyRequests { .. }));
        assert_eq!(dispatcher.passive().consecutive_failures(upstream.backend.id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_recorded_then_resumed() {
        let (dispatcher, _) = dispatcher(vec![Reply::Panic], 5, 100);

        let result = AssertUnwindSafe(dispatcher.handle(request())).catch_unwind().await;
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"forward exploded"));

        let upstream = &dispatcher.pool().upstreams()[0];
        assert_eq!(upstream.breaker.counts().total_failures, 1);
        assert_eq!(dispatcher.passive().consecutive_failures(upstream.backend.id()), 1);
    }

    fn picks(dispatcher: &Dispatcher<Arc<ScriptedForwarder>>, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| dispatcher.select().unwrap().backend.id().index())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_is_fair_over_healthy_backends() {
        let (dispatcher, _) = dispatcher(vec![Reply::Status(200); 3], 5, 100);
        assert_eq!(picks(&dispatcher, 9), [0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_in_the_middle_is_skipped() {
        let (dispatcher, _) = dispatcher(vec![Reply::Status(200); 3], 5, 100);
        dispatcher.pool().upstreams()[1].breaker.trip();

        assert_eq!(picks(&dispatcher, 10), [0, 2, 0, 2, 0, 2, 0, 2, 0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_forward_is_a_failure_for_breaker_and_monitor() {
        let (dispatcher, _) = dispatcher(vec![Reply::Hang], 5, 100);

        let cancelled = tokio::time::timeout(Duration::from_millis(10), dispatcher.handle(request())).await;
        assert!(cancelled.is_err());

        let upstream = &dispatcher.pool().upstreams()[0];
        assert_eq!(upstream.breaker.counts().consecutive_failures, 1);
        assert_eq!(dispatcher.passive().consecutive_failures(upstream.backend.id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_forward_is_recorded_once() {
        let (dispatcher, _) = dispatcher(vec![Reply::Refused], 5, 100);

        dispatcher.handle(request()).await.unwrap_err();

        let upstream = &dispatcher.pool().upstreams()[0];
        assert_eq!(upstream.breaker.counts().consecutive_failures, 1);
        assert_eq!(dispatcher.passive().consecutive_failures(upstream.backend.id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_transitions_are_observed_outside_selection() {
        type Scripted = Dispatcher<Arc<ScriptedForwarder>>;
        let slot: Arc<OnceLock<Weak<Scripted>>> = Arc::new(OnceLock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let observer = {
            let slot = slot.clone();
            let seen = seen.clone();
            move |t: &StateTransition| {
                // Selecting from inside the observer needs the cursor lock.
                let reentrant = match (t.to, slot.get().and_then(Weak::upgrade)) {
                    (CircuitState::HalfOpen, Some(d)) => d.select().ok().map(|u| u.backend.id().index()),
                    _ => None,
                };
                seen.lock().unwrap().push((t.from, t.to, reentrant));
            }
        };
        let hooks = ProxyHooks {
            trip_predicate: None,
            on_state_change: Some(Arc::new(observer)),
        };
        let (dispatcher, forwarder) = dispatcher_with_hooks(vec![Reply::Status(200); 2], 5, 100, &hooks);
        let dispatcher = Arc::new(dispatcher);
        slot.set(Arc::downgrade(&dispatcher)).unwrap();

        dispatcher.pool().upstreams()[0].breaker.trip();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Selection sees the elapsed timeout but leaves the transition pending.
        assert_eq!(dispatcher.select().unwrap().backend.id(), BackendId::new(0));
        assert_eq!(seen.lock().unwrap().len(), 1);

        dispatcher.handle(request()).await.unwrap();
        dispatcher.handle(request()).await.unwrap();
        assert_eq!(*forwarder.calls.lock().unwrap(), vec![1, 0]);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open, None),
                (CircuitState::Open, CircuitState::HalfOpen, Some(1)),
                (CircuitState::HalfOpen, CircuitState::Closed, None),
            ]
        );
    }
}
