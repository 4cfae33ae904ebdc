//! Request duplication for the primary and shadow branches.
//!
//! # Data Flow
//! ```text
//! inbound body ──▶ TeeBody ──▶ primary handler
//!                     │
//!                     └─ copies every chunk into a pooled buffer
//!                                     │
//!                                     ▼
//!                              ReplayBody ──▶ shadow handler
//! ```
//!
//! # Design Decisions
//! - The inbound body is read exactly once, by the primary branch
//! - The shadow view replays the shared buffer and waits when it catches up,
//!   so it sees every byte in order no matter which branch reads faster
//! - Route variables are cloned, never shared, between the two views
//! - If the primary drops its body before the end, the rest of the inbound
//!   body is drained in the background so the shadow still sees all of it

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::Request,
};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;
use tokio::sync::Notify;

use crate::http::request::{RequestId, RouteVars};
use crate::shadow::pool::{BufferPool, PooledBuf};

/// The two request views produced for one inbound request.
#[derive(Debug)]
pub struct RequestViews {
    pub primary: Request<Body>,
    pub shadow: Request<Body>,
}

/// Splits one inbound request into a primary and a shadow view.
#[derive(Debug, Clone)]
pub struct Duplicator {
    pool: BufferPool,
}

impl Duplicator {
    pub fn new(pool: BufferPool) -> Self {
        Self { pool }
    }

    /// Produce the two request views.
    pub fn duplicate(&self, request: Request<Body>) -> RequestViews {
        let (parts, body) = request.into_parts();

        let mut shadow = Request::builder()
            .method(parts.method.clone())
            .uri(parts.uri.clone())
            .version(parts.version)
            .body(Body::empty())
            .unwrap_or_default();
        *shadow.headers_mut() = parts.headers.clone();

        let extensions = shadow.extensions_mut();
        if let Some(vars) = parts.extensions.get::<RouteVars>() {
            extensions.insert(vars.clone());
        }
        if let Some(id) = parts.extensions.get::<RequestId>() {
            extensions.insert(id.clone());
        }
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            extensions.insert(ConnectInfo(*addr));
        }

        if body.is_end_stream() {
            return RequestViews {
                primary: Request::from_parts(parts, Body::empty()),
                shadow,
            };
        }

        let shared = Arc::new(TeeShared {
            state: Mutex::new(TeeState {
                buf: self.pool.get(),
                end: None,
            }),
            notify: Notify::new(),
        });

        let primary = Request::from_parts(
            parts,
            Body::new(TeeBody {
                inner: body,
                shared: shared.clone(),
                finished: false,
            }),
        );
        *shadow.body_mut() = Body::from_stream(replay(shared));

        RequestViews { primary, shadow }
    }
}

#[derive(Debug, Clone)]
enum TeeEnd {
    Complete,
    Failed(String),
}

struct TeeState {
    buf: PooledBuf,
    end: Option<TeeEnd>,
}

struct TeeShared {
    state: Mutex<TeeState>,
    notify: Notify,
}

enum Replay {
    Chunk(Bytes),
    Pending,
    End,
    Failed(String),
}

impl TeeShared {
    fn append(&self, chunk: &[u8]) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buf
            .extend_from_slice(chunk);
        self.notify.notify_waiters();
    }

    fn finish(&self, end: TeeEnd) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.end.is_none() {
            state.end = Some(end);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn next_chunk(&self, offset: usize) -> Replay {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if offset < state.buf.len() {
            return Replay::Chunk(Bytes::copy_from_slice(&state.buf[offset..]));
        }
        match &state.end {
            None => Replay::Pending,
            Some(TeeEnd::Complete) => Replay::End,
            Some(TeeEnd::Failed(reason)) => Replay::Failed(reason.clone()),
        }
    }
}

/// Primary view of the body: reads the inbound body and records every chunk.
struct TeeBody {
    inner: Body,
    shared: Arc<TeeShared>,
    finished: bool,
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.shared.append(data);
                }
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                self.shared.finish(TeeEnd::Failed(e.to_string()));
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.shared.finish(TeeEnd::Complete);
            }
            Poll::Pending => {}
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

impl Drop for TeeBody {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let inner = std::mem::replace(&mut self.inner, Body::empty());
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(drain(inner, shared));
            }
            Err(_) => shared.finish(TeeEnd::Failed(
                "request body abandoned outside a runtime".to_string(),
            )),
        }
    }
}

/// Read what the primary left unread into the shared buffer. Stops early
/// once the shadow view is gone.
async fn drain(mut body: Body, shared: Arc<TeeShared>) {
    while Arc::strong_count(&shared) > 1 {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    shared.append(data);
                }
            }
            Some(Err(e)) => return shared.finish(TeeEnd::Failed(e.to_string())),
            None => return shared.finish(TeeEnd::Complete),
        }
    }
}

/// Shadow view of the body: replays the shared buffer in order.
fn replay(
    shared: Arc<TeeShared>,
) -> impl futures_util::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some((shared, 0usize)), |state| async move {
        let (shared, offset) = state?;
        loop {
            let step = {
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                match shared.next_chunk(offset) {
                    Replay::Pending => {
                        notified.await;
                        continue;
                    }
                    step => step,
                }
            };

            return match step {
                Replay::Chunk(bytes) => {
                    let next = offset + bytes.len();
                    Some((Ok(bytes), Some((shared, next))))
                }
                Replay::Failed(reason) => Some((Err(io::Error::other(reason)), None)),
                Replay::End | Replay::Pending => None,
            };
        }
    })
}
