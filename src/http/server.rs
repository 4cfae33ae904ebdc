//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router sending every request to the shadow handler
//! - Wire up middleware (tracing, body limit, request ID)
//! - Provision the shadow handler from config, and again on every reload
//! - Map primary failures to gateway errors
//! - Wait for in-flight dispatches on shutdown

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::http::request::{request_id_middleware, RequestIdExt};
use crate::http::upstream::{UpstreamClient, UpstreamForwarder};
use crate::lifecycle::{signals::shutdown_signal, InFlight};
use crate::shadow::{Downstream, NextStage, ProvisionError, ShadowHandler};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ArcSwap<ShadowHandler>>,
    pub next: NextStage,
}

/// HTTP server hosting the shadow handler.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    state: AppState,
    client: UpstreamClient,
    inflight: InFlight,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ProvisionError> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let inflight = InFlight::new();

        let handler = build_handler(&config, &client, &inflight)?;
        let state = AppState {
            handler: Arc::new(ArcSwap::from_pointee(handler)),
            next: NextStage::empty(),
        };

        let router = Self::build_router(&config, state.clone());
        Ok(Self {
            router,
            config,
            state,
            client,
            inflight,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(shadow_handler))
            .route("/", any(shadow_handler))
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.limits.max_body_size))
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Applies every configuration received on `config_updates` and stops on
    /// `shutdown` or an OS signal, then waits for in-flight dispatches.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let reload_state = self.state.clone();
        let client = self.client.clone();
        let inflight = self.inflight.clone();
        let reloader = tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                match build_handler(&config, &client, &inflight) {
                    Ok(handler) => {
                        reload_state.handler.store(Arc::new(handler));
                        tracing::info!("Shadow configuration reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected configuration, keeping current one");
                    }
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown.recv() => tracing::info!("Shutdown requested"),
                    _ = shutdown_signal() => {}
                }
            })
            .await?;
        reloader.abort();

        let grace = self.state.handler.load().timeout() * 2;
        tracing::info!(
            in_flight = self.inflight.count(),
            grace = ?grace,
            "Waiting for shadow dispatches to settle"
        );
        if tokio::time::timeout(grace, self.inflight.wait_idle()).await.is_err() {
            tracing::warn!(in_flight = self.inflight.count(), "Shadow dispatches still running at exit");
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The handler currently serving requests.
    pub fn handler(&self) -> Arc<ShadowHandler> {
        self.state.handler.load_full()
    }
}

/// Provision a shadow handler forwarding to the configured upstreams.
pub fn build_handler(
    config: &ProxyConfig,
    client: &UpstreamClient,
    inflight: &InFlight,
) -> Result<ShadowHandler, ProvisionError> {
    let forwarder = |branch: &'static str, address: Option<&str>| {
        address
            .map(|address| {
                UpstreamForwarder::new(address, client.clone())
                    .map(|f| Arc::new(f) as Arc<dyn Downstream>)
                    .map_err(|reason| ProvisionError::Upstream {
                        branch,
                        address: address.to_string(),
                        reason,
                    })
            })
            .transpose()
    };

    let shadow_config = &config.shadow;
    let primary = forwarder("primary", shadow_config.primary.as_ref().map(|u| u.address.as_str()))?;
    let shadow = forwarder("shadow", shadow_config.shadow.as_ref().map(|u| u.address.as_str()))?;

    Ok(ShadowHandler::provision(shadow_config, primary, shadow)?.with_tracker(inflight.clone()))
}

/// Main handler: every request is shadowed.
async fn shadow_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = request.request_id();
    let handler = state.handler.load_full();

    match handler.serve(request, state.next.clone()).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Primary branch failed");
            e.into_response()
        }
    }
}
