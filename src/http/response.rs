//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map dispatch failures to client-facing status codes and bodies
//!
//! # Design Decisions
//! - Breaker rejections and an empty rotation are 503
//! - Transport failures are 502, forward timeouts 504
//! - Bodies are short fixed strings; details stay in the logs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::http::forward::ForwardError;
use crate::load_balancer::dispatcher::DispatchError;

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::CircuitOpen { .. }
            | DispatchError::TooManyRequests { .. }
            | DispatchError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::ForwardFailed {
                source: ForwardError::Timeout(_),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::ForwardFailed { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn client_message(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen { .. } => "circuit open",
            DispatchError::TooManyRequests { .. } => "too many requests",
            DispatchError::NoHealthyBackend => "no healthy backend",
            DispatchError::ForwardFailed {
                source: ForwardError::Timeout(_),
                ..
            } => "upstream timed out",
            DispatchError::ForwardFailed { .. } => "upstream request failed",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status_code(), self.client_message()).into_response()
    }
}
