//! Downstream processing units the shadow core runs its branches against.
//!
//! A [`Downstream`] takes a request and a [`NextStage`] continuation and
//! resolves to a full response. The core never calls the continuation
//! itself; it only hands it to the downstream units.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};

use crate::shadow::error::BranchError;

/// Boxed future returned by downstream units.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Result of running one downstream unit.
pub type DownstreamResult = Result<Response<Body>, BranchError>;

/// An opaque request handler supplied by the host.
pub trait Downstream: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, request: Request<Body>, next: NextStage) -> BoxFuture<DownstreamResult>;
}

impl<D: Downstream + ?Sized> Downstream for Arc<D> {
    fn call(&self, request: Request<Body>, next: NextStage) -> BoxFuture<DownstreamResult> {
        (**self).call(request, next)
    }
}

/// The continuation handed to downstream units.
///
/// An empty stage answers `404 Not Found`.
#[derive(Clone, Default)]
pub struct NextStage {
    inner: Option<Arc<dyn Downstream>>,
}

impl NextStage {
    /// Create a continuation running `handler`.
    pub fn new(handler: impl Downstream) -> Self {
        Self {
            inner: Some(Arc::new(handler)),
        }
    }

    /// A continuation with nothing behind it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Run the continuation.
    pub async fn run(&self, request: Request<Body>) -> DownstreamResult {
        match &self.inner {
            Some(handler) => handler.call(request, NextStage::empty()).await,
            None => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .map_err(|e| BranchError::Handler(e.to_string())),
        }
    }
}

impl std::fmt::Debug for NextStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextStage")
            .field("configured", &self.inner.is_some())
            .finish()
    }
}

/// A [`Downstream`] built from an async closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`Downstream`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Body>, NextStage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DownstreamResult> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Downstream for HandlerFn<F>
where
    F: Fn(Request<Body>, NextStage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DownstreamResult> + Send + 'static,
{
    fn call(&self, request: Request<Body>, next: NextStage) -> BoxFuture<DownstreamResult> {
        Box::pin((self.f)(request, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_next_stage_is_not_found() {
        let response = NextStage::empty()
            .run(Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handler_fn_calls_next() {
        let inner = handler_fn(|_req, _next| async {
            Ok(Response::builder().status(StatusCode::ACCEPTED).body(Body::empty()).unwrap())
        });
        let outer = handler_fn(|req, next: NextStage| async move { next.run(req).await });

        let response = outer
            .call(Request::new(Body::empty()), NextStage::new(inner))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
