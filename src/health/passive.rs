//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Track consecutive failures and successes per backend
//! - Trigger state transition on threshold breach
//!
//! # Design Decisions
//! - Breaker rejections, transport errors and 5xx count as failures
//! - Recording one outcome always zeroes the other streak
//! - A streak resets each time it reaches its threshold, so a flip fires
//!   once per crossing
//! - One monitor-wide lock; lock order is monitor then backend

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::PassiveHealthConfig;
use crate::health::state::{HealthSource, HealthStatus};
use crate::load_balancer::backend::{Backend, BackendId};

#[derive(Debug, Clone, Copy, Default)]
struct Streak {
    failures: u32,
    successes: u32,
}

/// Infers backend health from real traffic.
#[derive(Debug)]
pub struct PassiveMonitor {
    backends: Vec<Arc<Backend>>,
    failure_threshold: u32,
    success_threshold: u32,
    streaks: Mutex<Vec<Streak>>,
}

impl PassiveMonitor {
    /// `backends` must be ordered by their `BackendId`.
    pub fn new(backends: Vec<Arc<Backend>>, config: &PassiveHealthConfig) -> Self {
        let streaks = vec![Streak::default(); backends.len()];
        Self {
            backends,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            streaks: Mutex::new(streaks),
        }
    }

    fn streaks(&self) -> MutexGuard<'_, Vec<Streak>> {
        self.streaks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, id: BackendId) {
        let mut streaks = self.streaks();
        let (Some(streak), Some(backend)) = (streaks.get_mut(id.index()), self.backends.get(id.index()))
        else {
            tracing::debug!(backend = %id, "Success recorded for unknown backend");
            return;
        };

        streak.failures = 0;
        streak.successes = streak.successes.saturating_add(1);

        if streak.successes >= self.success_threshold {
            if backend.status() == HealthStatus::Unhealthy {
                backend.mark(HealthSource::Passive, HealthStatus::Healthy);
                tracing::info!(
                    backend = %backend.url(),
                    successes = self.success_threshold,
                    "Passive: backend marked healthy"
                );
            }
            streak.successes = 0;
        }
    }

    pub fn record_failure(&self, id: BackendId) {
        let mut streaks = self.streaks();
        let (Some(streak), Some(backend)) = (streaks.get_mut(id.index()), self.backends.get(id.index()))
        else {
            tracing::debug!(backend = %id, "Failure recorded for unknown backend");
            return;
        };

        streak.successes = 0;
        streak.failures = streak.failures.saturating_add(1);

        if streak.failures >= self.failure_threshold {
            if backend.status() == HealthStatus::Healthy {
                backend.mark(HealthSource::Passive, HealthStatus::Unhealthy);
                tracing::warn!(
                    backend = %backend.url(),
                    failures = self.failure_threshold,
                    "Passive: backend marked unhealthy"
                );
            }
            streak.failures = 0;
        }
    }

    pub fn consecutive_failures(&self, id: BackendId) -> u32 {
        self.streaks().get(id.index()).map_or(0, |s| s.failures)
    }

    pub fn consecutive_successes(&self, id: BackendId) -> u32 {
        self.streaks().get(id.index()).map_or(0, |s| s.successes)
    }
}
