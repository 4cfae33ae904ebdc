//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, hot-swappable shadow handler)
//!     → request.rs (request ID, route variables)
//!     → shadow:: (duplicate, dispatch, compare)
//!     → upstream.rs (forward each branch to its upstream)
//!     → primary response to client
//! ```

pub mod request;
pub mod server;
pub mod upstream;

pub use request::{request_id_middleware, RequestId, RequestIdExt, RouteVars, X_REQUEST_ID};
pub use server::HttpServer;
pub use upstream::{parse_upstream, UpstreamForwarder};
