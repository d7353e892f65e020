//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request
//!     → dispatcher.rs (select + forward through the breaker)
//!     → round_robin.rs (rotate over usable candidates)
//!     → pool.rs (backend + breaker pairs, in configured order)
//!     → backend.rs (health record of the chosen backend)
//! ```
//!
//! # Design Decisions
//! - Usability (healthy and breaker not open) is evaluated on every
//!   selection, never cached
//! - Backends are addressed by `BackendId`, never by address string
//! - Ordinal rotation only; no weights or latency awareness

pub mod backend;
pub mod dispatcher;
pub mod pool;
pub mod round_robin;

use std::fmt::Debug;

/// Strategy picking the next backend among `len` candidates.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Index of the next candidate for which `usable` holds, or `None`
    /// when no candidate is usable.
    fn next_index(&self, len: usize, usable: &dyn Fn(usize) -> bool) -> Option<usize>;
}

pub use backend::{Backend, BackendId};
pub use dispatcher::{DispatchError, Dispatcher};
pub use pool::{BackendPool, ProxyHooks, Upstream};
pub use round_robin::RoundRobin;
