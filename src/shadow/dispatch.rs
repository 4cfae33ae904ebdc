//! Dispatch orchestrator for one shadowed request.
//!
//! # Data Flow
//! ```text
//! Idle ──▶ Dispatching ──▶ PrimaryDone ──▶ Responding ──▶ Comparing ──▶ Done
//!               │                              │    └───────────────────▲
//!               └──────────▶ Errored ◀─────────┘                        │
//!                               └───────────────────────────────────────┘
//! ```
//!
//! # Design Decisions
//! - Both branches run as their own tasks with their own cancellation
//!   tokens; the inbound request's lifetime does not bound them, only their
//!   timeouts and the orchestrator do
//! - The primary response is released to the caller as soon as it exists and
//!   never waits on the shadow
//! - The orchestrator always joins the shadow branch and, if the primary was
//!   released, the end of the client write before comparing
//! - Leaving `dispatch` cancels both branch tokens and drops both outcomes,
//!   which returns every pooled buffer

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::http::request::RequestId;
use crate::observability::metrics::ShadowMetrics;
use crate::shadow::capture::{BranchOutcome, ClientChunks, ClientHead, ResponseCapture, Transport};
use crate::shadow::compare::ComparisonEngine;
use crate::shadow::downstream::{Downstream, NextStage};
use crate::shadow::duplicator::RequestViews;
use crate::shadow::error::BranchError;
use crate::shadow::policy::ComparisonPolicy;
use crate::shadow::pool::BufferPool;
use crate::shadow::report::MismatchReporter;
use crate::shadow::runner::{Branch, BranchRunner};

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
    PrimaryDone,
    Responding,
    Comparing,
    Done,
    Errored,
}

impl DispatchState {
    /// Whether `self → to` is a legal transition.
    pub fn can_transition(self, to: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, to),
            (Idle, Dispatching)
                | (Dispatching, PrimaryDone)
                | (Dispatching, Errored)
                | (PrimaryDone, Responding)
                | (Responding, Comparing)
                | (Responding, Done)
                | (Responding, Errored)
                | (Comparing, Done)
                | (Errored, Done)
        )
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Idle => "idle",
            DispatchState::Dispatching => "dispatching",
            DispatchState::PrimaryDone => "primary_done",
            DispatchState::Responding => "responding",
            DispatchState::Comparing => "comparing",
            DispatchState::Done => "done",
            DispatchState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of one dispatch.
#[derive(Debug)]
pub struct StateMachine {
    state: DispatchState,
    request_id: RequestId,
}

impl StateMachine {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            state: DispatchState::Idle,
            request_id,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Move to `to`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, to: DispatchState) -> bool {
        if !self.state.can_transition(to) {
            tracing::warn!(
                request_id = %self.request_id,
                from = %self.state,
                to = %to,
                "Illegal dispatch transition"
            );
            return false;
        }
        tracing::trace!(
            request_id = %self.request_id,
            from = %self.state,
            to = %to,
            "Dispatch transition"
        );
        self.state = to;
        true
    }
}

/// What the orchestrator hands back to the waiting caller.
#[derive(Debug)]
pub enum Release {
    /// The primary response, buffered or streaming.
    Respond(Response<Body>),
    /// The primary branch failed before anything was released.
    Failed(BranchError),
}

/// Everything a dispatch needs from its handler.
pub struct DispatchContext {
    pub primary: Arc<dyn Downstream>,
    pub shadow: Arc<dyn Downstream>,
    pub policy: Arc<ComparisonPolicy>,
    pub engine: ComparisonEngine,
    pub reporter: MismatchReporter,
    pub metrics: Arc<ShadowMetrics>,
    pub pool: BufferPool,
    pub timeout: Duration,
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Run one shadowed request from dispatch to `Done`.
pub async fn dispatch(
    ctx: Arc<DispatchContext>,
    request_id: RequestId,
    views: RequestViews,
    next: NextStage,
    release_tx: oneshot::Sender<Release>,
) -> DispatchState {
    let mut state = StateMachine::new(request_id.clone());
    let mut release_tx = Some(release_tx);
    state.advance(DispatchState::Dispatching);

    let primary_cancel = CancellationToken::new();
    let shadow_cancel = CancellationToken::new();
    let _primary_scope = primary_cancel.clone().drop_guard();
    let _shadow_scope = shadow_cancel.clone().drop_guard();

    let (transport, head_rx) = Transport::client();
    let primary_capture = ResponseCapture::new(ctx.policy.clone(), ctx.pool.clone(), transport);
    let shadow_capture = ResponseCapture::new(ctx.policy.clone(), ctx.pool.clone(), Transport::Discard);

    let primary_task = spawn_branch(&ctx, Branch::Primary, views.primary, next.clone(), primary_capture, primary_cancel);
    let shadow_task = spawn_branch(&ctx, Branch::Shadow, views.shadow, next, shadow_capture, shadow_cancel);

    let (written_tx, written_rx) = oneshot::channel();
    let mut written_tx = Some(written_tx);

    // Resolves with a head when the primary passes its response through,
    // or with an error once the capture no longer needs the client.
    if let Ok(head) = head_rx.await {
        if let (Some(tx), Some(written)) = (release_tx.take(), written_tx.take()) {
            let _ = tx.send(Release::Respond(streaming_response(head, written)));
        }
    }

    let primary = join_branch(Branch::Primary, primary_task).await;
    let primary_failed = primary.error.clone();
    state.advance(if primary.error == Some(BranchError::Panicked) {
        DispatchState::Errored
    } else {
        DispatchState::PrimaryDone
    });

    if state.state() == DispatchState::PrimaryDone {
        state.advance(DispatchState::Responding);
    }
    if let Some(tx) = release_tx.take() {
        let release = match &primary.error {
            Some(err) => Release::Failed(err.clone()),
            None => Release::Respond(buffered_response(&primary, written_tx.take())),
        };
        let _ = tx.send(release);
    }
    drop(written_tx);

    let shadow = join_branch(Branch::Shadow, shadow_task).await;
    let _ = tokio::time::timeout(ctx.timeout, written_rx).await;

    if primary_failed.is_some() {
        if state.state() == DispatchState::Responding {
            state.advance(DispatchState::Errored);
        }
    } else if ctx.policy.requires_any() {
        state.advance(DispatchState::Comparing);
        let report = ctx.engine.compare(&primary, &shadow);
        if report.body_checked() {
            ctx.metrics.record_comparison(report.is_match());
        }
        ctx.reporter.report(&request_id, &report, &primary, &shadow);
    }

    state.advance(DispatchState::Done);
    state.state()
}

fn spawn_branch(
    ctx: &DispatchContext,
    branch: Branch,
    request: Request<Body>,
    next: NextStage,
    capture: ResponseCapture,
    cancel: CancellationToken,
) -> JoinHandle<BranchOutcome> {
    let handler = match branch {
        Branch::Primary => Arc::clone(&ctx.primary),
        Branch::Shadow => Arc::clone(&ctx.shadow),
    };
    let runner = BranchRunner::new(branch, handler, next, ctx.timeout, Arc::clone(&ctx.metrics));
    tokio::spawn(runner.run(request, capture, cancel))
}

async fn join_branch(branch: Branch, task: JoinHandle<BranchOutcome>) -> BranchOutcome {
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(branch = %branch, error = %e, "Branch task failed");
            BranchOutcome::failed(branch, BranchError::Panicked)
        }
    }
}

fn buffered_response(
    primary: &BranchOutcome,
    written: Option<oneshot::Sender<()>>,
) -> Response<Body> {
    let bytes = Bytes::copy_from_slice(primary.body_bytes().unwrap_or_default());
    let mut response = Response::new(client_body(Body::from(bytes), written));
    *response.status_mut() = primary.status.unwrap_or(StatusCode::OK);
    *response.headers_mut() = primary.headers.clone();
    response
}

fn streaming_response(head: ClientHead, written: oneshot::Sender<()>) -> Response<Body> {
    let body = Body::from_stream(chunk_stream(head.chunks));
    let mut response = Response::new(client_body(body, Some(written)));
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

fn chunk_stream(
    chunks: ClientChunks,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(chunks, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

fn client_body(inner: Body, written: Option<oneshot::Sender<()>>) -> Body {
    match written {
        Some(written) => Body::new(ClientBody {
            inner,
            written: Some(written),
        }),
        None => inner,
    }
}

/// Body handed to the client that signals when the write is over.
struct ClientBody {
    inner: Body,
    written: Option<oneshot::Sender<()>>,
}

impl ClientBody {
    fn signal(&mut self) {
        if let Some(tx) = self.written.take() {
            let _ = tx.send(());
        }
    }
}

impl HttpBody for ClientBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(_))) if self.inner.is_end_stream() => self.signal(),
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => self.signal(),
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

impl Drop for ClientBody {
    fn drop(&mut self) {
        self.signal();
    }
}
