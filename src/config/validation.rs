//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check backend addresses parse the same way the pool will parse them
//! - Validate value ranges (intervals > 0, thresholds > 0, bind addresses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;
use crate::health::state::HealthMerge;
use crate::load_balancer::backend::{Backend, BackendId};

/// A single semantic problem, with the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_bind(&mut errors, "listener.bind_address", &config.listener.bind_address);

    if config.backends.is_empty() {
        errors.push(ValidationError::new("backends", "at least one backend is required"));
    }
    for (i, backend) in config.backends.iter().enumerate() {
        if let Err(e) = Backend::parse(BackendId::new(i), &backend.address, HealthMerge::default()) {
            errors.push(ValidationError::new(format!("backends[{i}].address"), e.reason));
        }
    }

    let hc = &config.health_check;
    if hc.enabled {
        non_zero(&mut errors, "health_check.interval_ms", hc.interval_ms);
        non_zero(&mut errors, "health_check.timeout_ms", hc.timeout_ms);
        if hc.path.is_empty() {
            errors.push(ValidationError::new("health_check.path", "must not be empty"));
        }
    }

    non_zero(&mut errors, "passive.failure_threshold", config.passive.failure_threshold.into());
    non_zero(&mut errors, "passive.success_threshold", config.passive.success_threshold.into());
    non_zero(
        &mut errors,
        "circuit_breaker.trip_consecutive_failures",
        config.circuit_breaker.trip_consecutive_failures.into(),
    );
    non_zero(&mut errors, "circuit_breaker.open_timeout_ms", config.circuit_breaker.open_timeout_ms);
    non_zero(&mut errors, "timeouts.request_secs", config.timeouts.request_secs);

    let rl = &config.rate_limit;
    if rl.enabled {
        non_zero(&mut errors, "rate_limit.requests_per_window", rl.requests_per_window.into());
        non_zero(&mut errors, "rate_limit.window_secs", rl.window_secs);
        non_zero(&mut errors, "rate_limit.burst_size", rl.burst_size.into());
    }

    if config.observability.metrics_enabled {
        check_bind(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if config.admin.enabled {
        check_bind(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn non_zero(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError::new(field, "must be greater than zero"));
    }
}

fn check_bind(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("'{value}' is not a socket address")));
    }
}
