//! Traffic shadowing core.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → duplicator.rs (two request views, body teed once)
//!     → runner.rs ×2 (primary, shadow; own timeout and cancellation each)
//!         → capture.rs (buffer, stream to client, or discard)
//!     → dispatch.rs (release primary response, join shadow)
//!     → compare.rs (status, headers, body)
//!     → report.rs + observability::metrics (logs, counters, histograms)
//! ```
//!
//! # Design Decisions
//! - Provisioned once from configuration; every query compiles up front
//! - Safe to serve many requests concurrently; per-request state lives in
//!   the dispatch task only
//! - The shadow response never reaches the caller

pub mod capture;
pub mod compare;
pub mod dispatch;
pub mod downstream;
pub mod duplicator;
pub mod error;
pub mod policy;
pub mod pool;
pub mod query;
pub mod report;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderName, Request, Response},
};
use tokio::sync::oneshot;

use crate::config::duration::parse_timeout;
use crate::config::schema::ShadowConfig;
use crate::http::request::RequestIdExt;
use crate::lifecycle::inflight::InFlight;
use crate::observability::metrics::ShadowMetrics;

pub use compare::{BodyCheck, ComparisonEngine, ComparisonReport};
pub use dispatch::{DispatchState, Release};
pub use downstream::{handler_fn, Downstream, NextStage};
pub use error::{BranchError, ProvisionError, ShadowError};
pub use policy::{ComparisonPolicy, LogLevel, ReportingPolicy};
pub use query::Query;
pub use runner::Branch;

use dispatch::DispatchContext;
use duplicator::Duplicator;
use pool::BufferPool;
use report::MismatchReporter;

/// A provisioned shadow handler.
///
/// Cheap to clone; clones share buffers, metrics and in-flight tracking.
#[derive(Debug, Clone)]
pub struct ShadowHandler {
    ctx: Arc<DispatchContext>,
    duplicator: Duplicator,
    inflight: InFlight,
}

impl ShadowHandler {
    /// Provision a handler from configuration and the two downstream units.
    ///
    /// Fails before serving anything if a handler is missing or any
    /// configured value does not compile.
    pub fn provision(
        config: &ShadowConfig,
        primary: Option<Arc<dyn Downstream>>,
        shadow: Option<Arc<dyn Downstream>>,
    ) -> Result<Self, ProvisionError> {
        let primary = primary.ok_or(ProvisionError::MissingHandler("primary"))?;
        let shadow = shadow.ok_or(ProvisionError::MissingHandler("shadow"))?;

        let headers = config
            .compare_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ProvisionError::HeaderName(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let comparison = Arc::new(ComparisonPolicy {
            status: config.compare_status,
            body: config.compare_body,
            headers,
            json: compile_queries("compare_json", &config.compare_json)?,
            ignore: compile_queries("ignore_json", &config.ignore_json)?,
        });
        let reporting = ReportingPolicy {
            suppress_log: config.no_log,
            level: config.log_level,
            redact: compile_queries("redact_json", &config.redact_json)?,
        };

        let timeout = parse_timeout(&config.timeout)
            .map_err(|e| ProvisionError::Timeout(config.timeout.clone(), e))?;

        let metrics = Arc::new(ShadowMetrics::register(
            config.metrics_name.as_deref(),
            comparison.requires_body(),
        ));

        tracing::debug!(
            compare_status = comparison.status,
            compare_body = comparison.body,
            compare_headers = comparison.headers.len(),
            compare_json = comparison.json.len(),
            timeout = ?timeout,
            "Shadow handler provisioned"
        );

        let pool = BufferPool::new();
        let ctx = DispatchContext {
            primary,
            shadow,
            engine: ComparisonEngine::new(Arc::clone(&comparison)),
            policy: comparison,
            reporter: MismatchReporter::new(reporting),
            metrics,
            pool: pool.clone(),
            timeout,
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            duplicator: Duplicator::new(pool),
            inflight: InFlight::new(),
        })
    }

    /// Track dispatches with `inflight` instead of a tracker of its own.
    pub fn with_tracker(mut self, inflight: InFlight) -> Self {
        self.inflight = inflight;
        self
    }

    /// Serve one request.
    ///
    /// Returns once the primary response is available. The rest of the
    /// dispatch (shadow join, comparison, reporting) carries on in the
    /// background; [`ShadowHandler::settled`] waits for it.
    pub async fn serve(
        &self,
        request: Request<Body>,
        next: NextStage,
    ) -> Result<Response<Body>, ShadowError> {
        let request_id = request.request_id();
        let views = self.duplicator.duplicate(request);
        let (release_tx, release_rx) = oneshot::channel();

        let guard = self.inflight.track();
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            dispatch::dispatch(ctx, request_id, views, next, release_tx).await;
            drop(guard);
        });

        match release_rx.await {
            Ok(Release::Respond(response)) => Ok(response),
            Ok(Release::Failed(err)) => Err(ShadowError::Primary(err)),
            Err(_) => Err(ShadowError::DispatchAborted),
        }
    }

    /// Resolves once every dispatch started so far has reached `Done`.
    pub async fn settled(&self) {
        self.inflight.wait_idle().await;
    }

    /// Number of dispatches not yet done.
    pub fn in_flight(&self) -> u64 {
        self.inflight.count()
    }

    /// Per-branch timeout.
    pub fn timeout(&self) -> Duration {
        self.ctx.timeout
    }

    /// The comparison policy in effect.
    pub fn comparison(&self) -> &ComparisonPolicy {
        &self.ctx.policy
    }

    /// Idle buffers currently held by the pool.
    pub fn idle_buffers(&self) -> usize {
        self.ctx.pool.idle_count()
    }
}

/// Compile one configured query list. Errors name the list and index.
pub fn compile_queries(list: &'static str, sources: &[String]) -> Result<Vec<Query>, ProvisionError> {
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            Query::compile(source).map_err(|e| ProvisionError::Query {
                list,
                index,
                source_text: source.clone(),
                source: e,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn noop() -> Option<Arc<dyn Downstream>> {
        Some(Arc::new(handler_fn(|_req, _next| async {
            Ok(Response::new(Body::empty()))
        })))
    }

    #[test]
    fn test_missing_handlers() {
        let config = ShadowConfig::default();
        let err = ShadowHandler::provision(&config, None, noop()).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingHandler("primary")));
        let err = ShadowHandler::provision(&config, noop(), None).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingHandler("shadow")));
    }

    #[test]
    fn test_bad_query_fails_provisioning() {
        let config = ShadowConfig {
            compare_json: vec![".ok".into(), ".[".into()],
            ..Default::default()
        };
        let err = ShadowHandler::provision(&config, noop(), noop()).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Query { list: "compare_json", index: 1, .. }
        ));
    }

    #[test]
    fn test_bad_timeout_fails_provisioning() {
        let config = ShadowConfig {
            timeout: "soon".into(),
            ..Default::default()
        };
        let err = ShadowHandler::provision(&config, noop(), noop()).unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout(..)));
    }

    #[test]
    fn test_bad_header_name_fails_provisioning() {
        let config = ShadowConfig {
            compare_headers: vec!["bad header".into()],
            ..Default::default()
        };
        let err = ShadowHandler::provision(&config, noop(), noop()).unwrap_err();
        assert!(matches!(err, ProvisionError::HeaderName(_)));
    }

    #[test]
    fn test_provision_policy() {
        let config = ShadowConfig {
            compare_headers: vec!["Content-Type".into()],
            compare_json: vec![".id".into()],
            timeout: "250ms".into(),
            ..Default::default()
        };
        let handler = ShadowHandler::provision(&config, noop(), noop()).unwrap();
        assert_eq!(handler.timeout(), Duration::from_millis(250));
        assert_eq!(handler.comparison().headers[0].as_str(), "content-type");
        assert!(handler.comparison().requires_body());
    }

    #[tokio::test]
    async fn test_serve_passes_primary_through() {
        let primary: Arc<dyn Downstream> = Arc::new(handler_fn(|_req, _next| async {
            Ok(Response::builder()
                .status(StatusCode::CREATED)
                .body(Body::from("primary"))
                .unwrap())
        }));
        let shadow: Arc<dyn Downstream> = Arc::new(handler_fn(|_req, _next| async {
            Ok(Response::new(Body::from("shadow")))
        }));
        let handler =
            ShadowHandler::provision(&ShadowConfig::default(), Some(primary), Some(shadow)).unwrap();

        let response = handler
            .serve(Request::new(Body::empty()), NextStage::empty())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"primary");

        handler.settled().await;
        assert_eq!(handler.in_flight(), 0);
    }
}
