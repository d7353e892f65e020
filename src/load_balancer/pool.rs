//! Backend pool management.
//!
//! # Responsibilities
//! - Build one backend and one circuit breaker per configured address
//! - Keep them paired and in configured order; the pair's index is its
//!   `BackendId`
//! - Wire the breaker observers (logs, metrics, embedder hook)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CircuitBreakerConfig, ProxyConfig};
use crate::load_balancer::backend::{Backend, BackendError, BackendId};
use crate::observability::breaker_events::BreakerEvents;
use crate::resilience::circuit_breaker::{
    self, BreakerSettings, CircuitBreaker, CircuitState, StateObserver, TripPredicate,
};

/// Programmatic extension points that cannot come from a config file.
#[derive(Clone, Default)]
pub struct ProxyHooks {
    /// Replaces the configured consecutive-failure trip rule.
    pub trip_predicate: Option<TripPredicate>,
    /// Called on every breaker transition, after the proxy's own logging.
    pub on_state_change: Option<Arc<dyn StateObserver>>,
}

impl fmt::Debug for ProxyHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHooks")
            .field("trip_predicate", &self.trip_predicate.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// A backend and the breaker guarding it.
#[derive(Debug)]
pub struct Upstream {
    pub backend: Arc<Backend>,
    pub breaker: CircuitBreaker,
}

impl Upstream {
    /// Healthy and breaker not open, evaluated now.
    ///
    /// Reads the breaker without applying a pending transition, so it never
    /// runs observers and may be called under the selection lock. The
    /// transition happens when the breaker next admits a request.
    pub fn is_usable(&self) -> bool {
        self.backend.is_healthy() && self.breaker.peek_state() != CircuitState::Open
    }
}

/// Ordered set of upstreams.
#[derive(Debug)]
pub struct BackendPool {
    upstreams: Vec<Upstream>,
}

impl BackendPool {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        Self { upstreams }
    }

    /// Create the pool from configuration.
    pub fn from_config(config: &ProxyConfig, hooks: &ProxyHooks) -> Result<Self, BackendError> {
        let merge = config.health_check.merge;
        let observer: Arc<dyn StateObserver> =
            Arc::new(BreakerEvents::new(hooks.on_state_change.clone()));

        let upstreams = config
            .backends
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let backend = Arc::new(Backend::parse(BackendId::new(i), &entry.address, merge)?);
                let name = entry
                    .name
                    .clone()
                    .unwrap_or_else(|| backend.url().to_string());
                let settings = breaker_settings(&config.circuit_breaker, hooks);
                let breaker = CircuitBreaker::new(name, settings).with_observer(observer.clone());

                tracing::info!(
                    backend = %backend.url(),
                    id = %backend.id(),
                    breaker = breaker.name(),
                    "Backend registered"
                );
                Ok(Upstream { backend, breaker })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(Self { upstreams })
    }

    pub fn get(&self, id: BackendId) -> Option<&Upstream> {
        self.upstreams.get(id.index())
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// All backends, ordered by `BackendId` (for the health checkers).
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.upstreams.iter().map(|u| u.backend.clone()).collect()
    }
}

pub fn breaker_settings(config: &CircuitBreakerConfig, hooks: &ProxyHooks) -> BreakerSettings {
    // Zero keeps the breaker's built-in predicate.
    let trip = hooks.trip_predicate.clone().or_else(|| {
        (config.trip_consecutive_failures > 0)
            .then(|| circuit_breaker::consecutive_failures(config.trip_consecutive_failures))
    });

    BreakerSettings {
        max_half_open_requests: config.max_half_open_requests,
        closed_window: (config.window_secs > 0).then(|| Duration::from_secs(config.window_secs)),
        open_timeout: Duration::from_millis(config.open_timeout_ms),
        trip,
    }
}
