//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Hold its health record behind its own lock
//! - Provide a stable handle (`BackendId`) used instead of address lookups

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use axum::http::uri::Authority;
use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::health::state::{HealthMerge, HealthRecord, HealthSource, HealthStatus};
use crate::observability::metrics;

/// Error building a backend from its configured address.
#[derive(Debug, thiserror::Error)]
#[error("invalid backend address '{address}': {reason}")]
pub struct BackendError {
    pub address: String,
    pub reason: String,
}

impl BackendError {
    fn new(address: &str, reason: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

/// Stable handle of a backend: its position in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BackendId(usize);

impl BackendId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Serializable view of a backend's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub active: Option<HealthStatus>,
    pub passive: Option<HealthStatus>,
    pub failure_count: u32,
    pub since_last_check_ms: u128,
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    /// Base URL; forwarded paths are appended to its path.
    url: Url,
    /// Pre-calculated authority for URI rewriting.
    authority: Authority,
    health: Mutex<HealthRecord>,
}

impl Backend {
    /// Parse a backend from `http://host:port[/base]` or bare `host:port`.
    pub fn parse(id: BackendId, address: &str, merge: HealthMerge) -> Result<Self, BackendError> {
        let trimmed = address.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        let url = Url::parse(&candidate).map_err(|e| BackendError::new(address, e.to_string()))?;
        if url.scheme() != "http" {
            return Err(BackendError::new(address, "only http backends are supported"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BackendError::new(address, "missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BackendError::new(address, "missing port"))?;
        let authority = Authority::from_str(&format!("{host}:{port}"))
            .map_err(|e| BackendError::new(address, e.to_string()))?;

        Ok(Self {
            id,
            url,
            authority,
            health: Mutex::new(HealthRecord::new(merge)),
        })
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    fn health(&self) -> MutexGuard<'_, HealthRecord> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Health Logic ---

    /// Effective status, derived from both health signals.
    pub fn status(&self) -> HealthStatus {
        self.health().status()
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Record a signal from one checker. Returns true if the effective
    /// status changed.
    pub fn mark(&self, source: HealthSource, status: HealthStatus) -> bool {
        let (previous, current) = {
            let mut health = self.health();
            let previous = health.record(source, status, Instant::now());
            (previous, health.status())
        };

        metrics::record_backend_health(self.url.as_str(), current == HealthStatus::Healthy);

        if let Some(previous) = previous {
            tracing::info!(
                backend = %self.url,
                source = %source,
                from = %previous,
                to = %current,
                "Backend health changed"
            );
        }
        previous.is_some()
    }

    pub fn last_check(&self) -> Instant {
        self.health().last_check()
    }

    pub fn failure_count(&self) -> u32 {
        self.health().failure_count()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let health = self.health();
        HealthSnapshot {
            status: health.status(),
            active: health.signal(HealthSource::Active).map(|s| s.status),
            passive: health.signal(HealthSource::Passive).map(|s| s.status),
            failure_count: health.failure_count(),
            since_last_check_ms: Instant::now()
                .saturating_duration_since(health.last_check())
                .as_millis(),
        }
    }
}
