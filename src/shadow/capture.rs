//! Response capture: the sink a branch's response is written into.
//!
//! # Responsibilities
//! - Record status and headers of one branch response
//! - Buffer the body when the comparison policy asks for it
//! - Otherwise count the body and either stream it to the client or discard it
//! - Produce a [`BranchOutcome`] once the branch is finished
//!
//! # Design Decisions
//! - The buffering decision is taken once, at the first status write, and
//!   fixes the sink's behavior for the rest of the response
//! - The shadow branch is always backed by [`Transport::Discard`]; its bytes
//!   have no path to the client
//! - A failed client write is recorded and the capture keeps counting, so the
//!   branch's bookkeeping is never cut short by a disconnect
//!
//! # Data Flow
//! ```text
//! write_head(status, headers)
//!     → should_buffer? ── yes ──▶ pooled buffer
//!                     └── no ───▶ Client: head + chunks over channels
//!                                 Discard: count only
//! ```

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::shadow::error::BranchError;
use crate::shadow::policy::ComparisonPolicy;
use crate::shadow::pool::{BufferPool, PooledBuf};
use crate::shadow::runner::Branch;

/// Capacity of the chunk channel to the client.
const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// Chunks streamed to the client.
pub type ClientChunks = mpsc::Receiver<Result<Bytes, io::Error>>;

/// Response head handed to the client side when a response is passed through.
#[derive(Debug)]
pub struct ClientHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub chunks: ClientChunks,
}

/// Where unbuffered bytes go.
#[derive(Debug)]
pub enum Transport {
    /// Pass the response through to the real client.
    Client(oneshot::Sender<ClientHead>),
    /// Count and drop.
    Discard,
}

impl Transport {
    /// A client transport together with the receiving end for the head.
    pub fn client() -> (Self, oneshot::Receiver<ClientHead>) {
        let (tx, rx) = oneshot::channel();
        (Transport::Client(tx), rx)
    }
}

#[derive(Debug)]
enum Mode {
    /// No status written yet.
    Pending(Transport),
    Buffering(PooledBuf),
    Streaming(mpsc::Sender<Result<Bytes, io::Error>>),
    Discarding,
}

/// The sink handed to a branch in place of the client connection.
#[derive(Debug)]
pub struct ResponseCapture {
    policy: Arc<ComparisonPolicy>,
    pool: BufferPool,
    mode: Mode,
    status: Option<StatusCode>,
    headers: HeaderMap,
    bytes_written: u64,
    client_error: Option<String>,
}

impl ResponseCapture {
    /// Create a capture that buffers according to `policy`.
    pub fn new(policy: Arc<ComparisonPolicy>, pool: BufferPool, transport: Transport) -> Self {
        Self {
            policy,
            pool,
            mode: Mode::Pending(transport),
            status: None,
            headers: HeaderMap::new(),
            bytes_written: 0,
            client_error: None,
        }
    }

    /// Record the status and headers. Only the first call has any effect.
    pub async fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        let transport = match std::mem::replace(&mut self.mode, Mode::Discarding) {
            Mode::Pending(transport) => transport,
            other => {
                self.mode = other;
                return;
            }
        };

        let buffer = self.policy.should_buffer(status, &headers);
        self.status = Some(status);

        self.mode = match transport {
            _ if buffer => Mode::Buffering(self.pool.get()),
            Transport::Client(head_tx) => {
                let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
                let head = ClientHead {
                    status,
                    headers: headers.clone(),
                    chunks: rx,
                };
                if head_tx.send(head).is_ok() {
                    Mode::Streaming(tx)
                } else {
                    self.client_error = Some("client response already gone".to_string());
                    Mode::Discarding
                }
            }
            Transport::Discard => Mode::Discarding,
        };
        self.headers = headers;
    }

    /// Write one body chunk. Implies a `200 OK` head if none was written.
    pub async fn write(&mut self, chunk: Bytes) {
        if matches!(self.mode, Mode::Pending(_)) {
            self.write_head(StatusCode::OK, HeaderMap::new()).await;
        }
        self.bytes_written += chunk.len() as u64;

        match &mut self.mode {
            Mode::Buffering(buf) => buf.extend_from_slice(&chunk),
            Mode::Streaming(tx) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    self.client_error = Some("client disconnected".to_string());
                    self.mode = Mode::Discarding;
                }
            }
            Mode::Discarding | Mode::Pending(_) => {}
        }
    }

    /// Whether the body is being buffered.
    pub fn is_buffering(&self) -> bool {
        matches!(self.mode, Mode::Buffering(_))
    }

    /// Status written so far.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Body bytes written so far, buffered or not.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finalize the capture into a branch outcome.
    ///
    /// When the response was streaming and the branch failed, the client
    /// stream is ended with an error rather than looking complete.
    pub async fn finish(self, branch: Branch, error: Option<BranchError>) -> BranchOutcome {
        let mut client_error = self.client_error;
        let body = match self.mode {
            Mode::Buffering(buf) => Some(buf),
            Mode::Streaming(tx) => {
                if let Some(err) = &error {
                    let sent = tx.send(Err(io::Error::other(err.to_string()))).await;
                    if sent.is_err() && client_error.is_none() {
                        client_error = Some("client disconnected".to_string());
                    }
                }
                None
            }
            Mode::Pending(_) | Mode::Discarding => None,
        };

        if let Some(reason) = &client_error {
            tracing::warn!(branch = %branch, error = %reason, "Client write failed");
        }

        BranchOutcome {
            branch,
            status: self.status,
            headers: self.headers,
            body,
            error,
            bytes_written: self.bytes_written,
            client_error,
            ttfb: None,
            total: None,
        }
    }
}

/// Wraps a capture and records when the first byte is written.
#[derive(Debug)]
pub struct TimedCapture {
    inner: ResponseCapture,
    first_byte: Option<Instant>,
}

impl TimedCapture {
    pub fn new(inner: ResponseCapture) -> Self {
        Self {
            inner,
            first_byte: None,
        }
    }

    fn started(&mut self) {
        if self.first_byte.is_none() {
            self.first_byte = Some(Instant::now());
        }
    }

    pub async fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        self.started();
        self.inner.write_head(status, headers).await;
    }

    pub async fn write(&mut self, chunk: Bytes) {
        self.started();
        self.inner.write(chunk).await;
    }

    /// Instant of the first status or body write.
    pub fn first_byte(&self) -> Option<Instant> {
        self.first_byte
    }

    pub fn into_inner(self) -> ResponseCapture {
        self.inner
    }
}

/// Everything one branch produced for one request.
#[derive(Debug)]
pub struct BranchOutcome {
    pub branch: Branch,
    /// Status written by the branch, if it got that far.
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    /// Buffered body; `None` unless buffering was enabled for this response.
    pub body: Option<PooledBuf>,
    pub error: Option<BranchError>,
    pub bytes_written: u64,
    /// Set when passing bytes through to the client failed.
    pub client_error: Option<String>,
    /// Time from processing start to first byte written.
    pub ttfb: Option<Duration>,
    /// Time from processing start to handler return.
    pub total: Option<Duration>,
}

impl BranchOutcome {
    /// An outcome for a branch that produced nothing.
    pub fn failed(branch: Branch, error: BranchError) -> Self {
        Self {
            branch,
            status: None,
            headers: HeaderMap::new(),
            body: None,
            error: Some(error),
            bytes_written: 0,
            client_error: None,
            ttfb: None,
            total: None,
        }
    }

    /// Body bytes, if buffered.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref().map(|b| &b[..])
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// All values of one header, in order.
    pub fn header_values(&self, name: &axum::http::HeaderName) -> Vec<String> {
        self.headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect()
    }
}
