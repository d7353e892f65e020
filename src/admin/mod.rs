//! Admin API.
//!
//! Served on its own listener, guarded by a Bearer API key. Exposes the
//! live breaker and health state of every backend and lets an operator
//! force a breaker open or closed.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::time::Instant;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::health::passive::PassiveMonitor;
use crate::load_balancer::pool::BackendPool;

#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<BackendPool>,
    pub passive: Arc<PassiveMonitor>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(pool: Arc<BackendPool>, passive: Arc<PassiveMonitor>, api_key: &str) -> Self {
        Self {
            pool,
            passive,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(get_backends))
        .route("/admin/backends/{index}/trip", post(trip_backend))
        .route("/admin/backends/{index}/reset", post(reset_backend))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, PassiveHealthConfig, ProxyConfig};
    use crate::load_balancer::pool::ProxyHooks;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let config = ProxyConfig {
            backends: vec![BackendConfig::new("127.0.0.1:3001"), BackendConfig::new("127.0.0.1:3002")],
            ..Default::default()
        };
        let pool = Arc::new(BackendPool::from_config(&config, &ProxyHooks::default()).unwrap());
        let passive = Arc::new(PassiveMonitor::new(pool.backends(), &PassiveHealthConfig::default()));
        setup_admin_router(AdminState::new(pool, passive, "secret"))
    }

    fn request(method: &str, uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let app = router();
        let none = app.clone().oneshot(request("GET", "/admin/status", None)).await.unwrap();
        assert_eq!(none.status(), StatusCode::UNAUTHORIZED);
        let wrong = app.oneshot(request("GET", "/admin/status", Some("nope"))).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn lists_backends_with_breaker_state() {
        let response = router()
            .oneshot(request("GET", "/admin/backends", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[1]["address"], "http://127.0.0.1:3002/");
        assert_eq!(body[1]["breaker"]["state"], "closed");
        assert_eq!(body[1]["health"]["status"], "healthy");
        assert_eq!(body[1]["passive"]["consecutive_failures"], 0);
    }

    #[tokio::test]
    async fn trip_and_reset_change_usability() {
        let app = router();

        let tripped = json(
            app.clone()
                .oneshot(request("POST", "/admin/backends/0/trip", Some("secret")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(tripped["breaker"]["state"], "open");
        assert_eq!(tripped["usable"], false);

        let status = json(app.clone().oneshot(request("GET", "/admin/status", Some("secret"))).await.unwrap()).await;
        assert_eq!(status["backends_usable"], 1);

        let reset = json(
            app.clone()
                .oneshot(request("POST", "/admin/backends/0/reset", Some("secret")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(reset["breaker"]["state"], "closed");

        let missing = app
            .oneshot(request("POST", "/admin/backends/9/trip", Some("secret")))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
