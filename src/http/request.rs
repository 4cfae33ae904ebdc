//! Request identity and per-request route variables.
//!
//! # Responsibilities
//! - Assign a request ID (reuse `x-request-id` or generate a UUID v4)
//! - Seed the route-variables map carried in request extensions
//! - Echo the request ID on the response
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Route variables are a plain owned map; anything that runs a request
//!   concurrently must clone it rather than share it

use std::collections::HashMap;
use std::fmt;

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Unique identifier of one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extension trait to read the request ID off a request.
pub trait RequestIdExt {
    /// The request ID, or `"unknown"` when none was assigned.
    fn request_id(&self) -> RequestId;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> RequestId {
        if let Some(id) = self.extensions().get::<RequestId>() {
            return id.clone();
        }
        self.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(RequestId::from)
            .unwrap_or_else(|| RequestId::from("unknown"))
    }
}

/// Mutable variables attached to a request while it is routed.
///
/// Not safe to share between concurrently running handlers; clone it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteVars(HashMap<String, Value>);

impl RouteVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Middleware assigning the request ID and seeding route variables.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(RequestId::from)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(id.as_str()).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(X_REQUEST_ID, value.clone());
    }

    let mut vars = request
        .extensions_mut()
        .remove::<RouteVars>()
        .unwrap_or_default();
    vars.insert("request_id", id.as_str());
    request.extensions_mut().insert(vars);
    request.extensions_mut().insert(id);

    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}
