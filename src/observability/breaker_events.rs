//! Breaker state-change reporting.
//!
//! Every breaker in the pool gets a [`BreakerEvents`] observer: it logs the
//! transition, updates the `proxy_circuit_state` gauge and then forwards
//! the event to the observer supplied by the embedding application, if any.

use std::sync::Arc;

use crate::observability::metrics;
use crate::resilience::circuit_breaker::{CircuitState, StateObserver, StateTransition};

pub struct BreakerEvents {
    downstream: Option<Arc<dyn StateObserver>>,
}

impl BreakerEvents {
    pub fn new(downstream: Option<Arc<dyn StateObserver>>) -> Self {
        Self { downstream }
    }
}

impl StateObserver for BreakerEvents {
    fn on_state_change(&self, transition: &StateTransition) {
        match transition.to {
            CircuitState::Open => tracing::warn!(
                breaker = %transition.name,
                from = %transition.from,
                to = %transition.to,
                generation = transition.generation,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %transition.name,
                from = %transition.from,
                to = %transition.to,
                generation = transition.generation,
                "Circuit breaker state changed"
            ),
        }

        metrics::record_circuit_state(&transition.name, transition.to);

        if let Some(downstream) = &self.downstream {
            downstream.on_state_change(transition);
        }
    }
}
