//! Resilient reverse proxy library.
//!
//! Per-backend circuit breakers, active and passive health checking and a
//! health-filtered round-robin dispatcher, served through Axum.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::{HttpServer, ServerError};
pub use lifecycle::Shutdown;
pub use load_balancer::pool::ProxyHooks;
