use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::admin::AdminState;
use crate::load_balancer::backend::{BackendId, HealthSnapshot};
use crate::load_balancer::pool::Upstream;
use crate::resilience::circuit_breaker::BreakerSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub backends_total: usize,
    pub backends_usable: usize,
}

#[derive(Serialize)]
pub struct PassiveStreaks {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Serialize)]
pub struct BackendStatus {
    pub index: usize,
    pub name: String,
    pub address: String,
    pub usable: bool,
    pub health: HealthSnapshot,
    pub breaker: BreakerSnapshot,
    pub passive: PassiveStreaks,
}

impl BackendStatus {
    fn collect(state: &AdminState, upstream: &Upstream) -> Self {
        let id = upstream.backend.id();
        Self {
            index: id.index(),
            name: upstream.breaker.name().to_string(),
            address: upstream.backend.url().to_string(),
            usable: upstream.is_usable(),
            health: upstream.backend.health_snapshot(),
            breaker: upstream.breaker.snapshot(),
            passive: PassiveStreaks {
                consecutive_failures: state.passive.consecutive_failures(id),
                consecutive_successes: state.passive.consecutive_successes(id),
            },
        }
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let upstreams = state.pool.upstreams();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        backends_total: upstreams.len(),
        backends_usable: upstreams.iter().filter(|u| u.is_usable()).count(),
    })
}

pub async fn get_backends(State(state): State<AdminState>) -> Json<Vec<BackendStatus>> {
    let statuses = state
        .pool
        .upstreams()
        .iter()
        .map(|u| BackendStatus::collect(&state, u))
        .collect();
    Json(statuses)
}

pub async fn trip_backend(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> Result<Json<BackendStatus>, StatusCode> {
    let upstream = state.pool.get(BackendId::new(index)).ok_or(StatusCode::NOT_FOUND)?;
    tracing::warn!(backend = %upstream.backend.url(), "Breaker tripped via admin API");
    upstream.breaker.trip();
    Ok(Json(BackendStatus::collect(&state, upstream)))
}

pub async fn reset_backend(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> Result<Json<BackendStatus>, StatusCode> {
    let upstream = state.pool.get(BackendId::new(index)).ok_or(StatusCode::NOT_FOUND)?;
    tracing::info!(backend = %upstream.backend.url(), "Breaker reset via admin API");
    upstream.breaker.reset();
    Ok(Json(BackendStatus::collect(&state, upstream)))
}
