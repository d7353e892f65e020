//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each backend concurrently
//!     → Write the active signal (state.rs)
//!
//! Passive health checks (passive.rs):
//!     Request outcome observed by the dispatcher
//!     → Update consecutive failure/success streaks
//!     → Write the passive signal when a threshold is crossed
//!
//! State (state.rs):
//!     Active + passive signals → merge rule → Healthy | Unhealthy
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary and stored separately
//! - Passive transitions require consecutive successes/failures
//! - Health state is per-backend, not per-pool

pub mod active;
pub mod passive;
pub mod state;

pub use state::{HealthMerge, HealthSource, HealthStatus};
