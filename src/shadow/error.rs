//! Error definitions for the shadow core.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::shadow::query::QueryError;

/// Errors detected while provisioning a shadow handler.
///
/// All of these are raised before the handler serves any request.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A primary or shadow handler definition is missing.
    #[error("missing {0} handler")]
    MissingHandler(&'static str),

    /// A query in one of the query lists failed to compile.
    #[error("error parsing {list} query {index} ({source_text:?}): {source}")]
    Query {
        list: &'static str,
        index: usize,
        source_text: String,
        #[source]
        source: QueryError,
    },

    /// The timeout string is not a valid duration.
    #[error("error parsing timeout {0:?}: {1}")]
    Timeout(String, String),

    /// A configured header name is not a valid HTTP header name.
    #[error("invalid header name {0:?}")]
    HeaderName(String),

    /// An upstream address cannot be forwarded to.
    #[error("invalid {branch} upstream {address:?}: {reason}")]
    Upstream {
        branch: &'static str,
        address: String,
        reason: String,
    },
}

/// Errors produced by one branch of a shadowed request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BranchError {
    /// The upstream could not be reached or returned a transport error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The downstream handler itself failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Reading the response body failed part way.
    #[error("body error: {0}")]
    Body(String),

    /// The branch did not finish within its timeout.
    #[error("branch timed out after {0:?}")]
    Timeout(Duration),

    /// The branch scope was cancelled before it finished.
    #[error("branch cancelled")]
    Cancelled,

    /// The branch task panicked.
    #[error("branch panicked")]
    Panicked,
}

/// Errors surfaced to the host for one inbound request.
#[derive(Debug, Error)]
pub enum ShadowError {
    /// The primary branch failed; nothing was written to the client.
    #[error("primary branch failed: {0}")]
    Primary(BranchError),

    /// The dispatch task ended without releasing a primary response.
    #[error("shadow dispatch aborted")]
    DispatchAborted,
}

impl ShadowError {
    /// Status the host answers with when this error reaches it.
    pub fn status(&self) -> StatusCode {
        match self {
            ShadowError::Primary(BranchError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ShadowError::Primary(_) => StatusCode::BAD_GATEWAY,
            ShadowError::DispatchAborted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ShadowError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
