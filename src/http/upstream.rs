//! Forwarding a branch to an upstream server.
//!
//! # Responsibilities
//! - Rewrite the request URI and `Host` to the upstream's authority
//! - Strip hop-by-hop headers, including those named in `Connection`
//! - Propagate the request ID
//! - Map transport failures to [`BranchError::Upstream`]
//!
//! # Design Decisions
//! - One pooled hyper client is shared by both branches
//! - Upstreams are plain HTTP; TLS termination happens elsewhere

use std::str::FromStr;

use axum::{
    body::Body,
    http::{
        header,
        uri::{Authority, PathAndQuery, Scheme},
        HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, Version,
    },
};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use url::Url;

use crate::http::request::{RequestIdExt, X_REQUEST_ID};
use crate::shadow::downstream::{BoxFuture, Downstream, DownstreamResult, NextStage};
use crate::shadow::error::BranchError;

/// HTTP client used for upstream requests.
pub type UpstreamClient = Client<HttpConnector, Body>;

/// Headers meaningful only for a single transport-level connection.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers and every header listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Parse an upstream address (`host:port` or `http://host:port`) into an authority.
pub fn parse_upstream(address: &str) -> Result<Authority, String> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| e.to_string())?;
    if url.scheme() != "http" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    let host = url.host_str().ok_or_else(|| "missing host".to_string())?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Authority::from_str(&authority).map_err(|e| e.to_string())
}

/// A [`Downstream`] that forwards requests to one upstream server.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    authority: Authority,
    client: UpstreamClient,
}

impl UpstreamForwarder {
    /// Create a forwarder for `address`.
    pub fn new(address: &str, client: UpstreamClient) -> Result<Self, String> {
        Ok(Self {
            authority: parse_upstream(address)?,
            client,
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    fn rewrite(&self, request: Request<Body>) -> Result<Request<Body>, BranchError> {
        let request_id = request.request_id();
        let (mut parts, body) = request.into_parts();

        let mut uri_parts = parts.uri.clone().into_parts();
        uri_parts.scheme = Some(Scheme::HTTP);
        uri_parts.authority = Some(self.authority.clone());
        if uri_parts.path_and_query.is_none() {
            uri_parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        parts.uri = Uri::from_parts(uri_parts).map_err(|e| BranchError::Upstream(e.to_string()))?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
            parts.headers.insert(header::HOST, host);
        }
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            parts.headers.insert(X_REQUEST_ID, value);
        }

        Ok(Request::from_parts(parts, body))
    }
}

impl Downstream for UpstreamForwarder {
    fn call(&self, request: Request<Body>, _next: NextStage) -> BoxFuture<DownstreamResult> {
        let request = self.rewrite(request);
        let client = self.client.clone();
        let authority = self.authority.clone();

        Box::pin(async move {
            let request = request?;
            let response: Response<Incoming> = client.request(request).await.map_err(|e| {
                tracing::debug!(upstream = %authority, error = %e, "Upstream request failed");
                BranchError::Upstream(e.to_string())
            })?;
            Ok(response.map(Body::new))
        })
    }
}
