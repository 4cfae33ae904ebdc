//! Branch runner: executes one downstream unit against one request view.
//!
//! # Responsibilities
//! - Tag the branch's own route variables with its identity
//! - Bound execution by the branch timeout and its cancellation token
//! - Pump the downstream response into the branch's capture
//! - Measure time to first byte and total time from processing start
//!
//! # Design Decisions
//! - Processing start is taken when the downstream unit finishes consuming
//!   the request body, or at dispatch when there is none. Both branches then
//!   measure from the point their input was complete, which keeps tee
//!   ordering out of the latency comparison
//! - A branch error is logged with the branch identity and returned in the
//!   outcome; it never touches the other branch

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::{body::Body, http::Request};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

use crate::http::request::{RequestIdExt, RouteVars};
use crate::observability::metrics::ShadowMetrics;
use crate::shadow::capture::{BranchOutcome, ResponseCapture, TimedCapture};
use crate::shadow::downstream::{Downstream, NextStage};
use crate::shadow::error::BranchError;

/// Route variable holding the name of the branch a request runs on.
pub const BRANCH_VAR: &str = "shadow.branch";

/// Identity of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Primary,
    Shadow,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Primary => "primary",
            Branch::Shadow => "shadow",
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing-start bookkeeping for one branch.
#[derive(Debug)]
pub struct BranchClock {
    dispatched: Instant,
    started: OnceLock<Instant>,
}

impl BranchClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatched: Instant::now(),
            started: OnceLock::new(),
        })
    }

    /// Mark processing start. Only the first call counts.
    pub fn mark_started(&self) {
        let _ = self.started.set(Instant::now());
    }

    /// Processing start, falling back to dispatch time if never marked.
    pub fn started(&self) -> Instant {
        self.started.get().copied().unwrap_or(self.dispatched)
    }

    /// Wrap the request body so processing start is marked once it is consumed.
    fn watch_body(self: &Arc<Self>, request: Request<Body>) -> Request<Body> {
        let (parts, body) = request.into_parts();
        if body.is_end_stream() {
            self.mark_started();
            return Request::from_parts(parts, body);
        }
        let body = Body::new(FinishBody {
            inner: body,
            clock: Arc::clone(self),
        });
        Request::from_parts(parts, body)
    }
}

/// Request body that marks processing start on end, error, or drop.
struct FinishBody {
    inner: Body,
    clock: Arc<BranchClock>,
}

impl HttpBody for FinishBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(_))) if self.inner.is_end_stream() => self.clock.mark_started(),
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => self.clock.mark_started(),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for FinishBody {
    fn drop(&mut self) {
        self.clock.mark_started();
    }
}

/// Runs one branch of a shadowed request.
pub struct BranchRunner {
    branch: Branch,
    handler: Arc<dyn Downstream>,
    next: NextStage,
    timeout: Duration,
    metrics: Arc<ShadowMetrics>,
}

impl BranchRunner {
    /// Create a runner for `branch`.
    pub fn new(
        branch: Branch,
        handler: Arc<dyn Downstream>,
        next: NextStage,
        timeout: Duration,
        metrics: Arc<ShadowMetrics>,
    ) -> Self {
        Self {
            branch,
            handler,
            next,
            timeout,
            metrics,
        }
    }

    /// Run the branch to completion, timeout, or cancellation.
    pub async fn run(
        self,
        mut request: Request<Body>,
        capture: ResponseCapture,
        cancel: CancellationToken,
    ) -> BranchOutcome {
        let request_id = request.request_id();
        tag_branch(&mut request, self.branch);

        let clock = BranchClock::new();
        let request = clock.watch_body(request);
        let mut sink = TimedCapture::new(capture);

        let result = {
            let work = execute(self.handler.as_ref(), request, self.next.clone(), &mut sink);
            tokio::select! {
                _ = cancel.cancelled() => Err(BranchError::Cancelled),
                r = tokio::time::timeout(self.timeout, work) => {
                    r.unwrap_or_else(|_| Err(BranchError::Timeout(self.timeout)))
                }
            }
        };
        let finished = Instant::now();

        let started = clock.started();
        let ttfb = sink
            .first_byte()
            .map(|t| t.saturating_duration_since(started));
        let total = match &result {
            Err(BranchError::Timeout(_)) | Err(BranchError::Cancelled) => None,
            _ => Some(finished.saturating_duration_since(started)),
        };

        match &result {
            Err(BranchError::Cancelled) => {
                tracing::debug!(request_id = %request_id, branch = %self.branch, "Branch cancelled");
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    branch = %self.branch,
                    error = %e,
                    "Branch handler failed"
                );
            }
            Ok(()) => {}
        }

        self.metrics.record_branch(self.branch, ttfb, total);

        let mut outcome = sink.into_inner().finish(self.branch, result.err()).await;
        outcome.ttfb = ttfb;
        outcome.total = total;

        tracing::trace!(
            request_id = %request_id,
            branch = %self.branch,
            status = ?outcome.status,
            bytes = outcome.bytes_written,
            buffered = outcome.body.is_some(),
            ttfb = ?ttfb,
            total = ?total,
            "Branch finished"
        );
        outcome
    }
}

fn tag_branch(request: &mut Request<Body>, branch: Branch) {
    let extensions = request.extensions_mut();
    match extensions.get_mut::<RouteVars>() {
        Some(vars) => {
            vars.insert(BRANCH_VAR, branch.as_str());
        }
        None => {
            let mut vars = RouteVars::new();
            vars.insert(BRANCH_VAR, branch.as_str());
            extensions.insert(vars);
        }
    }
}

async fn execute(
    handler: &dyn Downstream,
    request: Request<Body>,
    next: NextStage,
    sink: &mut TimedCapture,
) -> Result<(), BranchError> {
    let response = handler.call(request, next).await?;
    let (parts, mut body) = response.into_parts();

    sink.write_head(parts.status, parts.headers).await;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BranchError::Body(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                sink.write(data).await;
            }
        }
    }
    Ok(())
}
