//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, proxy handler)
//!     → request.rs (request ID, hop-by-hop headers)
//!     → [dispatcher picks backend, breaker admits]
//!     → forward.rs (rewrite URI, send, classify outcome)
//!     → response.rs (dispatch failures → status codes)
//!     → Send to client
//! ```

pub mod forward;
pub mod request;
pub mod response;
pub mod server;

pub use forward::{ForwardError, Forwarder, HttpForwarder};
pub use request::{MakeRequestUuid, X_REQUEST_ID};
pub use server::{HttpServer, ServerError};
