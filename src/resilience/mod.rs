//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → circuit_breaker.rs (admit, or fail fast while open)
//!     → forward (bounded by the forward timeout)
//!     → circuit_breaker.rs (record outcome in the admitting generation)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - No retries: a retried request would be counted twice by the breaker
//! - Circuit breaker prevents cascading failures

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerError, BreakerSettings, CircuitBreaker, CircuitState, Counts};
