//! Upstream forwarding.
//!
//! # Responsibilities
//! - Rewrite the inbound request onto the selected backend
//! - Send it with a bounded wait for the response head
//! - Classify the outcome for the circuit breaker
//!
//! # Design Decisions
//! - Bodies are streamed in both directions, never buffered
//! - A 5xx response is an `Err` carrying the response, so the breaker
//!   counts it while the caller can still relay it
//! - The timeout lives here rather than in a server-wide layer, so an
//!   expiry completes the breaker call instead of cancelling it

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{
    header::{self, HeaderValue},
    uri::{PathAndQuery, Scheme},
    Request, Response, Uri, Version,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::config::TimeoutConfig;
use crate::http::request::{strip_hop_by_hop, X_FORWARDED_FOR};
use crate::load_balancer::backend::Backend;

/// A 5xx response received from a backend.
pub struct UpstreamResponse(pub Response<Body>);

impl UpstreamResponse {
    pub fn status(&self) -> axum::http::StatusCode {
        self.0.status()
    }

    pub fn into_inner(self) -> Response<Body> {
        self.0
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpstreamResponse").field(&self.status()).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream connection failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned {}", .0.status())]
    ServerError(UpstreamResponse),
    #[error("cannot build upstream uri: {0}")]
    InvalidUri(String),
}

/// Address of the peer that sent the inbound request.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Sends a request to one backend.
pub trait Forwarder: Send + Sync + 'static {
    fn forward(
        &self,
        request: Request<Body>,
        backend: &Backend,
    ) -> impl Future<Output = Result<Response<Body>, ForwardError>> + Send;
}

/// Forwarder backed by a pooled hyper client.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(config: &TimeoutConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(config.connect_secs.max(1))));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            timeout: Duration::from_secs(config.request_secs.max(1)),
        }
    }
}

impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        request: Request<Body>,
        backend: &Backend,
    ) -> Result<Response<Body>, ForwardError> {
        let (mut parts, body) = request.into_parts();

        parts.uri = rewrite_uri(&parts.uri, backend)?;
        // The pooled client speaks HTTP/1.1 to backends regardless of the
        // inbound protocol.
        parts.version = Version::HTTP_11;

        let client_addr = parts.extensions.get::<ClientAddr>().map(|c| c.0);
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr);
        }

        let request = Request::from_parts(parts, body);
        let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ForwardError::Transport(Box::new(e))),
            Err(_) => return Err(ForwardError::Timeout(self.timeout)),
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let response = Response::from_parts(parts, Body::new(body));

        if response.status().is_server_error() {
            Err(ForwardError::ServerError(UpstreamResponse(response)))
        } else {
            Ok(response)
        }
    }
}

/// Point `uri` at `backend`: scheme and authority replaced, the backend's
/// base path prefixed to the inbound path, query kept.
pub fn rewrite_uri(uri: &Uri, backend: &Backend) -> Result<Uri, ForwardError> {
    let base = backend.url().path().trim_end_matches('/');
    let path = uri.path();
    let joined = match uri.query() {
        Some(query) => format!("{base}{path}?{query}"),
        None => format!("{base}{path}"),
    };
    let path_and_query =
        PathAndQuery::try_from(joined).map_err(|e| ForwardError::InvalidUri(e.to_string()))?;

    Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(backend.authority().clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ForwardError::InvalidUri(e.to_string()))
}

fn append_forwarded_for(headers: &mut axum::http::HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthMerge;
    use crate::load_balancer::backend::BackendId;
    use axum::http::HeaderMap;

    fn backend(address: &str) -> Backend {
        Backend::parse(BackendId::new(0), address, HealthMerge::LastWriter).unwrap()
    }

    #[test]
    fn rewrite_replaces_authority_and_keeps_query() {
        let uri: Uri = "/users/7?expand=true".parse().unwrap();
        let rewritten = rewrite_uri(&uri, &backend("127.0.0.1:3001")).unwrap();
        assert_eq!(rewritten, "http://127.0.0.1:3001/users/7?expand=true");
    }

    #[test]
    fn rewrite_joins_base_path() {
        let uri: Uri = "/users".parse().unwrap();
        let rewritten = rewrite_uri(&uri, &backend("http://10.0.0.1:8080/api/")).unwrap();
        assert_eq!(rewritten, "http://10.0.0.1:8080/api/users");

        let absolute: Uri = "http://proxy.local/x?y=1".parse().unwrap();
        let rewritten = rewrite_uri(&absolute, &backend("http://10.0.0.1:8080/api")).unwrap();
        assert_eq!(rewritten, "http://10.0.0.1:8080/api/x?y=1");
    }

    #[test]
    fn forwarded_for_appends_client() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.1.1.1:5000".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.1.1");

        append_forwarded_for(&mut headers, "10.2.2.2:5000".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.1.1, 10.2.2.2");
    }

    #[test]
    fn server_error_debug_shows_status() {
        let response = Response::builder().status(503).body(Body::empty()).unwrap();
        let err = ForwardError::ServerError(UpstreamResponse(response));
        assert_eq!(err.to_string(), "upstream returned 503 Service Unavailable");
        assert!(format!("{err:?}").contains("503"));
    }
}
