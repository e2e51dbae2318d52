//! Shared-listener gateway: one TCP socket, two protocols.
//!
//! Every request passes through [`classify`]. WebSocket upgrades go to the
//! realtime transport, everything else to the control-plane router.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{FromRequestParts, Request, State, ws::WebSocketUpgrade},
    http::{HeaderMap, Method, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use proto::GatewayError;
use store::Datastore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::control;
use crate::origin::AllowedOrigins;
use crate::registry::{ChannelRegistry, EventPublisher};
use crate::transport;

// ─── Request classifier ────────────────────────────────────

/// Which surface a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// WebSocket upgrade for the realtime transport.
    Realtime,
    /// Plain request/response call.
    ControlPlane,
}

/// Decide whether a request is a realtime upgrade or a control-plane call.
pub fn classify(method: &Method, headers: &HeaderMap) -> RequestKind {
    let upgrade = header_has_token(headers, header::UPGRADE, "websocket");
    let connection = header_has_token(headers, header::CONNECTION, "upgrade");
    if *method == Method::GET && upgrade && connection {
        RequestKind::Realtime
    } else {
        RequestKind::ControlPlane
    }
}

/// Whether any comma-separated value of `name` equals `token`, ignoring case.
fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

// ─── Shared state ──────────────────────────────────────────

/// Listener settings for [`GatewayServer`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interface to bind.
    pub host: String,
    /// Shared port for realtime and control-plane traffic.
    pub port: u16,
    /// Comma-separated allowed origins; empty or `*` allows all.
    pub allowed_origins: String,
    /// Per-connection queue length for published events.
    pub outbox_capacity: usize,
    /// How long shutdown waits for realtime connections to close.
    pub drain_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: String::new(),
            outbox_capacity: 64,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared by the classifier, the transport and control-plane handlers.
pub struct GatewayState {
    registry: Arc<ChannelRegistry>,
    datastore: Option<Arc<dyn Datastore>>,
    origins: AllowedOrigins,
    outbox_capacity: usize,
    shutdown: watch::Receiver<bool>,
}

impl GatewayState {
    /// Channel registry backing both surfaces.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Publish interface for request handlers.
    pub fn publisher(&self) -> &dyn EventPublisher {
        self.registry.as_ref()
    }

    /// Datastore connection, when one was attached.
    pub fn datastore(&self) -> Option<&Arc<dyn Datastore>> {
        self.datastore.as_ref()
    }

    /// State without a listener, for driving the router in-process.
    #[cfg(test)]
    pub(crate) fn detached(
        registry: Arc<ChannelRegistry>,
        datastore: Option<Arc<dyn Datastore>>,
    ) -> Arc<Self> {
        let (_tx, shutdown) = watch::channel(false);
        Arc::new(Self {
            registry,
            datastore,
            origins: AllowedOrigins::Any,
            outbox_capacity: 8,
            shutdown,
        })
    }
}

/// Builds the full application: control-plane routes behind the classifier.
pub fn build_router(state: Arc<GatewayState>, routes: Router<Arc<GatewayState>>) -> Router {
    let cors = state.origins.cors_layer();
    routes
        .fallback(control::not_found)
        .with_state(state.clone())
        .layer(cors)
        .layer(middleware::from_fn_with_state(state, dispatch))
        .layer(TraceLayer::new_for_http())
}

/// Request classifier middleware.
async fn dispatch(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    match classify(request.method(), request.headers()) {
        RequestKind::ControlPlane => next.run(request).await,
        RequestKind::Realtime => {
            let (mut parts, _body) = request.into_parts();
            match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(ws) => transport::accept(
                    ws,
                    &parts.headers,
                    &state.origins,
                    state.registry.clone(),
                    state.outbox_capacity,
                    state.shutdown.clone(),
                ),
                Err(rejection) => rejection.into_response(),
            }
        }
    }
}

// ─── GatewayServer ─────────────────────────────────────────

/// Bound gateway, ready to serve.
pub struct GatewayServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown_tx: watch::Sender<bool>,
    routes: Router<Arc<GatewayState>>,
    drain_timeout: Duration,
}

impl GatewayServer {
    /// Bind the shared listening socket.
    ///
    /// An occupied port is reported as [`GatewayError::AddrInUse`]; there is
    /// no retry and no fallback port.
    pub async fn bind(
        config: &GatewayConfig,
        registry: Arc<ChannelRegistry>,
        datastore: Option<Arc<dyn Datastore>>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| bind_error(config.port, e))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(GatewayState {
            registry,
            datastore,
            origins: AllowedOrigins::parse(&config.allowed_origins),
            outbox_capacity: config.outbox_capacity,
            shutdown: shutdown_rx,
        });

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Gateway listening");
        }
        Ok(Self {
            listener,
            state,
            shutdown_tx,
            routes: control::routes(),
            drain_timeout: config.drain_timeout,
        })
    }

    /// Merge additional control-plane routes (business handlers).
    pub fn with_routes(mut self, routes: Router<Arc<GatewayState>>) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Local address the server is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared state handed to handlers.
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Serve until `signal` resolves, then close every realtime connection.
    pub async fn serve<F>(self, signal: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state.clone(), self.routes);
        let shutdown_tx = self.shutdown_tx;

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("Gateway shutting down, closing realtime connections");
                let _ = shutdown_tx.send(true);
            })
            .await;

        drain(&self.state.registry, self.drain_timeout).await;
        result.map_err(|e| GatewayError::Serve(e.to_string()))
    }
}

/// Maps a bind failure, singling out an occupied port.
fn bind_error(port: u16, e: std::io::Error) -> GatewayError {
    if e.kind() == std::io::ErrorKind::AddrInUse {
        GatewayError::AddrInUse { port }
    } else {
        GatewayError::Bind {
            port,
            reason: e.to_string(),
        }
    }
}

/// Wait for realtime connections to leave the registry.
async fn drain(registry: &ChannelRegistry, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while registry.connection_count() > 0 {
        if Instant::now() >= deadline {
            warn!(
                remaining = registry.connection_count(),
                "Drain timeout reached with connections still open"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("All realtime connections closed");
}

// ─── Tests ─────────────────────────────────────────────────
