//! Rate limiting middleware.
//!
//! Admission runs before dispatch: a refused request never reaches the
//! dispatcher and has no effect on breaker or health state.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::http::request::X_FORWARDED_FOR;
use crate::observability::metrics;
use crate::security::limiters::{FixedWindow, SlidingWindow, TokenBucket};

pub const X_RATELIMIT_EXCEEDED: &str = "x-ratelimit-exceeded";
pub const X_RATELIMIT_ALLOWED: &str = "x-ratelimit-allowed";

/// Admission decision for one client identity.
pub trait AdmissionControl: Send + Sync {
    fn allow(&self, client: &str) -> bool;

    /// Label used in logs and metrics.
    fn algorithm(&self) -> &'static str {
        "custom"
    }
}

/// Build the configured limiter, or `None` when rate limiting is disabled.
pub fn from_config(config: &RateLimitConfig) -> Option<Arc<dyn AdmissionControl>> {
    if !config.enabled {
        return None;
    }
    let window = Duration::from_secs(config.window_secs);
    let limiter: Arc<dyn AdmissionControl> = match config.algorithm {
        RateLimitAlgorithm::FixedWindow => {
            Arc::new(FixedWindow::new(config.requests_per_window, window))
        }
        RateLimitAlgorithm::SlidingWindow => {
            Arc::new(SlidingWindow::new(config.requests_per_window, window))
        }
        RateLimitAlgorithm::TokenBucket => Arc::new(TokenBucket::new(
            config.burst_size,
            config.requests_per_window,
            window,
        )),
    };
    tracing::info!(
        algorithm = limiter.algorithm(),
        limit = config.requests_per_window,
        window_secs = config.window_secs,
        "Rate limiting enabled"
    );
    Some(limiter)
}

/// Client identity: first `X-Forwarded-For` entry if it is an IP, else the
/// peer address.
pub fn client_identity<B>(request: &Request<B>) -> String {
    let forwarded = request
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|first| first.parse::<IpAddr>().is_ok());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware applying an [`AdmissionControl`] to every request.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<dyn AdmissionControl>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = client_identity(&request);

    if !limiter.allow(&client) {
        tracing::warn!(client = %client, algorithm = limiter.algorithm(), "Rate limit exceeded");
        metrics::record_rate_limited(limiter.algorithm());
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
        response
            .headers_mut()
            .insert(X_RATELIMIT_EXCEEDED, HeaderValue::from_static("true"));
        return response;
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(X_RATELIMIT_ALLOWED, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    fn request_with(xff: Option<&str>, peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(xff) = xff {
            builder = builder.header("x-forwarded-for", xff);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            request
                .extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        request
    }

    #[test]
    fn identity_prefers_first_forwarded_ip() {
        let r = request_with(Some(" 203.0.113.9 , 10.0.0.1"), Some("127.0.0.1:5000"));
        assert_eq!(client_identity(&r), "203.0.113.9");
    }

    #[test]
    fn identity_falls_back_to_peer() {
        let r = request_with(Some("not-an-ip, 10.0.0.1"), Some("127.0.0.1:5000"));
        assert_eq!(client_identity(&r), "127.0.0.1");

        let r = request_with(None, None);
        assert_eq!(client_identity(&r), "unknown");
    }

    #[test]
    fn disabled_config_builds_nothing() {
        assert!(from_config(&RateLimitConfig::default()).is_none());
        let enabled = RateLimitConfig {
            enabled: true,
            algorithm: RateLimitAlgorithm::FixedWindow,
            ..Default::default()
        };
        assert_eq!(from_config(&enabled).unwrap().algorithm(), "fixed_window");
    }

    #[tokio::test]
    async fn middleware_sets_headers_and_rejects() {
        let limiter: Arc<dyn AdmissionControl> =
            Arc::new(FixedWindow::new(1, Duration::from_secs(60)));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

        let first = app.clone().oneshot(request_with(Some("10.0.0.5"), None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_RATELIMIT_ALLOWED], "true");

        let second = app.clone().oneshot(request_with(Some("10.0.0.5"), None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[X_RATELIMIT_EXCEEDED], "true");

        let other = app.oneshot(request_with(Some("10.0.0.6"), None)).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }
}
