//! Shadow traffic proxy.
//!
//! Every inbound request is served by a primary upstream and replayed
//! against a shadow upstream. The caller only ever sees the primary
//! response; the two responses are compared in the background and
//! differences are logged and counted.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod shadow;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use shadow::ShadowHandler;
