//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (identify client, ask the admission control)
//!     → limiters.rs (fixed window, sliding window, token bucket)
//!     → admitted: pass to dispatcher; refused: 429
//! ```
//!
//! # Design Decisions
//! - Client identity is the first forwarded IP, else the peer IP
//! - Refused requests never touch breaker or health state

pub mod limiters;
pub mod rate_limit;

pub use rate_limit::AdmissionControl;
