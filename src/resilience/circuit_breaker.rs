//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: trip predicate true when a failure is recorded
//! Open → Half-Open: after open timeout (evaluated lazily)
//! Half-Open → Closed: max_half_open_requests consecutive successes
//! Half-Open → Open: any single failure
//! ```
//!
//! # Generations
//! Every transition (and every elapsed closed window) starts a new
//! generation: the counter increments and all counts reset. A request is
//! stamped with the generation it was admitted in; its outcome is dropped
//! if the breaker has moved on by the time it completes.
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Lock held for bookkeeping only, never across the wrapped call
//! - Observers are notified after the lock is released
//! - A cancelled or panicking call is recorded as a failure

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Requests admitted in this generation.
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Decides whether a closed breaker should open, given its counts.
pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

/// Trip predicate used when none is configured.
pub fn default_trip_predicate() -> TripPredicate {
    Arc::new(|counts: &Counts| counts.consecutive_failures > 5)
}

/// Trip once `threshold` consecutive failures have been recorded.
pub fn consecutive_failures(threshold: u32) -> TripPredicate {
    Arc::new(move |counts: &Counts| counts.consecutive_failures >= threshold)
}

/// Event emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Generation started by this transition.
    pub generation: u64,
}

/// Receives breaker state transitions.
///
/// Called synchronously after the breaker lock has been released, so an
/// observer may query the breaker that notified it.
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, transition: &StateTransition);
}

impl<F> StateObserver for F
where
    F: Fn(&StateTransition) + Send + Sync,
{
    fn on_state_change(&self, transition: &StateTransition) {
        self(transition)
    }
}

/// Breaker tuning.
#[derive(Clone)]
pub struct BreakerSettings {
    /// Trial requests allowed while half-open, and the consecutive
    /// successes needed to close again. Zero is treated as one.
    pub max_half_open_requests: u32,
    /// Rolling window after which a closed breaker clears its counts.
    pub closed_window: Option<Duration>,
    /// Time spent open before trials are allowed. Zero means 60 seconds.
    pub open_timeout: Duration,
    /// Trip predicate; `consecutive_failures > 5` when absent.
    pub trip: Option<TripPredicate>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_half_open_requests: 1,
            closed_window: None,
            open_timeout: Duration::from_secs(60),
            trip: None,
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("closed_window", &self.closed_window)
            .field("open_timeout", &self.open_timeout)
            .field("trip", &self.trip.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not run.
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// All half-open trial slots of this generation are taken.
    #[error("too many requests in half-open state")]
    TooManyRequests,
    /// The operation ran and returned an error.
    #[error("operation failed: {0}")]
    Operation(E),
    /// The operation panicked. Only produced by `execute_catching`.
    #[error("operation panicked")]
    Aborted(Box<dyn Any + Send>),
}

impl<E> BreakerError<E> {
    /// True when the breaker refused to run the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen | BreakerError::TooManyRequests)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Circuit breaker guarding calls to one backend.
pub struct CircuitBreaker {
    name: String,
    max_half_open_requests: u32,
    closed_window: Option<Duration>,
    open_timeout: Duration,
    trip: TripPredicate,
    observer: Option<Arc<dyn StateObserver>>,
    core: Mutex<BreakerCore>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("closed_window", &self.closed_window)
            .field("open_timeout", &self.open_timeout)
            .field("core", &*self.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let open_timeout = if settings.open_timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            settings.open_timeout
        };

        let breaker = Self {
            name: name.into(),
            max_half_open_requests: settings.max_half_open_requests.max(1),
            closed_window: settings.closed_window.filter(|w| !w.is_zero()),
            open_timeout,
            trip: settings.trip.unwrap_or_else(default_trip_predicate),
            observer: None,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };

        {
            let mut core = breaker.lock();
            breaker.new_generation(&mut core, Instant::now());
        }
        breaker
    }

    /// Attach a state-change observer.
    pub fn with_observer(mut self, observer: Arc<dyn StateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker.
    ///
    /// A panic inside the operation is recorded as a failure and then
    /// resumed with its original payload.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.execute_catching(operation).await {
            Err(BreakerError::Aborted(payload)) => panic::resume_unwind(payload),
            other => other,
        }
    }

    /// Like [`execute`](Self::execute), but a panic is returned as
    /// [`BreakerError::Aborted`] instead of being resumed.
    pub async fn execute_catching<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_admit()?;
        let ticket = Admission {
            breaker: self,
            generation,
            settled: false,
        };

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                ticket.complete(true);
                Ok(value)
            }
            Ok(Err(err)) => {
                ticket.complete(false);
                Err(BreakerError::Operation(err))
            }
            Err(payload) => {
                ticket.complete(false);
                Err(BreakerError::Aborted(payload))
            }
        }
    }

    /// Current state, applying any elapsed timeout first.
    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    /// State as [`state`](Self::state) would report it, without applying
    /// the transition or notifying the observer.
    ///
    /// Safe to call while holding other locks.
    pub fn peek_state(&self) -> CircuitState {
        let core = self.lock();
        match core.state {
            CircuitState::Open if core.expiry.map_or(true, |expiry| expiry <= Instant::now()) => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    pub fn counts(&self) -> Counts {
        self.snapshot().counts
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut events = Vec::new();
        let snapshot = {
            let mut core = self.lock();
            self.current_state(&mut core, Instant::now(), &mut events);
            BreakerSnapshot {
                state: core.state,
                generation: core.generation,
                counts: core.counts,
            }
        };
        self.notify(events);
        snapshot
    }

    /// Force the breaker open, restarting nothing if it already is.
    pub fn trip(&self) {
        self.force(CircuitState::Open);
    }

    /// Force the breaker closed with fresh counts.
    pub fn reset(&self) {
        self.force(CircuitState::Closed);
    }

    fn force(&self, target: CircuitState) {
        let mut events = Vec::new();
        {
            let mut core = self.lock();
            self.set_state(&mut core, target, Instant::now(), &mut events);
        }
        self.notify(events);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_admit<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut events = Vec::new();
        let admitted = {
            let mut core = self.lock();
            let (state, generation) = self.current_state(&mut core, Instant::now(), &mut events);

            match state {
                CircuitState::Open => Err(BreakerError::CircuitOpen),
                CircuitState::HalfOpen if core.counts.requests >= self.max_half_open_requests => {
                    Err(BreakerError::TooManyRequests)
                }
                _ => {
                    core.counts.on_request();
                    Ok(generation)
                }
            }
        };
        self.notify(events);
        admitted
    }

    fn after_complete(&self, generation: u64, success: bool) {
        let mut events = Vec::new();
        {
            let mut core = self.lock();
            let now = Instant::now();
            let (state, current) = self.current_state(&mut core, now, &mut events);

            if generation != current {
                tracing::trace!(
                    breaker = %self.name,
                    admitted_generation = generation,
                    current_generation = current,
                    success,
                    "Discarding stale result"
                );
            } else if success {
                core.counts.on_success();
                if state == CircuitState::HalfOpen
                    && core.counts.consecutive_successes >= self.max_half_open_requests
                {
                    self.set_state(&mut core, CircuitState::Closed, now, &mut events);
                }
            } else {
                core.counts.on_failure();
                if state == CircuitState::HalfOpen || (self.trip)(&core.counts) {
                    self.set_state(&mut core, CircuitState::Open, now, &mut events);
                }
            }
        }
        self.notify(events);
    }

    fn current_state(
        &self,
        core: &mut BreakerCore,
        now: Instant,
        events: &mut Vec<StateTransition>,
    ) -> (CircuitState, u64) {
        match core.state {
            CircuitState::Closed => {
                if core.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(core, now);
                }
            }
            CircuitState::Open => {
                if core.expiry.map_or(true, |expiry| expiry <= now) {
                    self.set_state(core, CircuitState::HalfOpen, now, events);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (core.state, core.generation)
    }

    fn set_state(
        &self,
        core: &mut BreakerCore,
        target: CircuitState,
        now: Instant,
        events: &mut Vec<StateTransition>,
    ) {
        if core.state == target {
            return;
        }

        let from = core.state;
        core.state = target;
        self.new_generation(core, now);

        events.push(StateTransition {
            name: self.name.clone(),
            from,
            to: target,
            generation: core.generation,
        });
    }

    fn new_generation(&self, core: &mut BreakerCore, now: Instant) {
        core.generation += 1;
        core.counts = Counts::default();
        core.expiry = match core.state {
            CircuitState::Closed => self.closed_window.map(|window| now + window),
            CircuitState::Open => Some(now + self.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn notify(&self, events: Vec<StateTransition>) {
        for event in events {
            tracing::debug!(
                breaker = %event.name,
                from = %event.from,
                to = %event.to,
                generation = event.generation,
                "Circuit breaker transition"
            );
            if let Some(observer) = &self.observer {
                observer.on_state_change(&event);
            }
        }
    }
}

/// An admitted request. Dropping it unsettled records a failure, so a
/// cancelled call cannot hold a half-open trial slot forever.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission<'_> {
    fn complete(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_complete(self.generation, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_complete(self.generation, false);
        }
    }
}
