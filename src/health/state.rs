//! Backend health state machine.
//!
//! # States
//! - Healthy: backend receives traffic
//! - Unhealthy: backend excluded from load balancing
//!
//! # Signals
//! Health is fed by two independent signals: the active prober and the
//! passive traffic monitor. Each signal is stored separately and the
//! effective status is derived from both through a [`HealthMerge`] rule,
//! instead of letting the two writers overwrite a single field.
//!
//! # Design Decisions
//! - A backend with no signal yet is Healthy
//! - Failure count grows on every Unhealthy mark and resets on Healthy
//! - Signal recency is tracked with a write sequence, not timestamps

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Effective health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("healthy"),
            HealthStatus::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Which checker produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSource {
    Active,
    Passive,
}

impl fmt::Display for HealthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthSource::Active => f.write_str("active"),
            HealthSource::Passive => f.write_str("passive"),
        }
    }
}

/// Rule combining the active and passive signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthMerge {
    /// The most recent signal from either checker wins.
    #[default]
    LastWriter,
    /// An unhealthy probe always excludes the backend; a passive eviction
    /// holds until a later probe reports healthy.
    ProbeAuthoritative,
}

impl HealthMerge {
    fn resolve(self, active: Option<Signal>, passive: Option<Signal>) -> HealthStatus {
        match self {
            HealthMerge::LastWriter => [active, passive]
                .into_iter()
                .flatten()
                .max_by_key(|signal| signal.seq)
                .map_or(HealthStatus::Healthy, |signal| signal.status),
            HealthMerge::ProbeAuthoritative => {
                let active_down = active.is_some_and(|a| a.status == HealthStatus::Unhealthy);
                let passive_down = passive.is_some_and(|p| {
                    p.status == HealthStatus::Unhealthy && active.map_or(true, |a| p.seq > a.seq)
                });
                if active_down || passive_down {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }
}

/// One observation from a checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub status: HealthStatus,
    pub observed_at: Instant,
    seq: u64,
}

/// Health record of a single backend.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    merge: HealthMerge,
    active: Option<Signal>,
    passive: Option<Signal>,
    status: HealthStatus,
    last_check: Instant,
    failure_count: u32,
    writes: u64,
}

impl HealthRecord {
    pub fn new(merge: HealthMerge) -> Self {
        Self {
            merge,
            active: None,
            passive: None,
            status: HealthStatus::Healthy,
            last_check: Instant::now(),
            failure_count: 0,
            writes: 0,
        }
    }

    /// Store a signal and re-derive the effective status.
    ///
    /// Returns the previous status when the effective status changed.
    pub fn record(
        &mut self,
        source: HealthSource,
        status: HealthStatus,
        now: Instant,
    ) -> Option<HealthStatus> {
        self.writes += 1;
        let signal = Signal {
            status,
            observed_at: now,
            seq: self.writes,
        };
        match source {
            HealthSource::Active => self.active = Some(signal),
            HealthSource::Passive => self.passive = Some(signal),
        }

        self.last_check = now;
        match status {
            HealthStatus::Healthy => self.failure_count = 0,
            HealthStatus::Unhealthy => self.failure_count = self.failure_count.saturating_add(1),
        }

        let previous = self.status;
        self.status = self.merge.resolve(self.active, self.passive);
        (previous != self.status).then_some(previous)
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn signal(&self, source: HealthSource) -> Option<Signal> {
        match source {
            HealthSource::Active => self.active,
            HealthSource::Passive => self.passive,
        }
    }

    pub fn last_check(&self) -> Instant {
        self.last_check
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}
