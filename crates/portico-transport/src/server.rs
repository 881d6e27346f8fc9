//! HTTP transport server using Axum.
//!
//! Buffers each inbound request, hands it to the dispatch core through the
//! [`RequestHandler`] trait, and writes the produced response back. Also
//! serves the health and admin endpoints under [`ADMIN_PREFIX`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use portico_protocol::{DispatchError, DispatchRequest, DispatchResponse, DispatchResult, HandlerRules};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Path prefix reserved for the server's own endpoints.
pub const ADMIN_PREFIX: &str = "/_portico";

/// Trait implemented by the dispatch core to handle incoming requests.
/// The transport layer calls this for every request outside [`ADMIN_PREFIX`].
pub trait RequestHandler: Send + Sync + 'static {
    /// Run one request through the dispatch core.
    fn handle_request(
        &self,
        request: DispatchRequest,
    ) -> impl std::future::Future<Output = DispatchResult<DispatchResponse>> + Send;

    /// Admin view of the live interceptor chain.
    fn interceptors(&self) -> Value {
        Value::Null
    }

    /// Admin view of the registered serving contexts.
    fn contexts(&self) -> Value {
        Value::Null
    }

    /// Currently applied handler rules, if any.
    fn rules(&self) -> Option<HandlerRules> {
        None
    }

    /// Replace the handler rules wholesale. Returns the new chain description.
    fn replace_rules(&self, _rules: HandlerRules) -> DispatchResult<Value> {
        Err(DispatchError::InvalidRules("rules are not reconfigurable".into()))
    }
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Maximum concurrently dispatched requests; excess gets 503
    pub max_in_flight: Option<usize>,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Expose the interceptor/rules/contexts admin endpoints
    pub enable_admin: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            hostname: "127.0.0.1".into(),
            enable_cors: false,
            max_in_flight: Some(1024),
            max_body_bytes: 2 * 1024 * 1024,
            enable_admin: false,
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: RequestHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Requests currently inside the dispatch core
    in_flight: AtomicUsize,
}

/// The transport server: owns the listener task.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Bind and start serving with the given request handler.
    pub async fn start<H: RequestHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let app = router(&config, handler);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Portico listening on http://{}:{}", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server, letting in-flight requests finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Portico transport stopped");
    }
}

/// Build the axum router without binding a socket.
pub fn router<H: RequestHandler>(config: &TransportConfig, handler: Arc<H>) -> Router {
    let state = Arc::new(AppState {
        handler,
        config: config.clone(),
        in_flight: AtomicUsize::new(0),
    });

    let mut app = Router::new().route(&format!("{ADMIN_PREFIX}/health"), get(health_handler::<H>));

    if config.enable_admin {
        app = app
            .route(&format!("{ADMIN_PREFIX}/interceptors"), get(interceptors_handler::<H>))
            .route(
                &format!("{ADMIN_PREFIX}/rules"),
                get(get_rules_handler::<H>).put(put_rules_handler::<H>),
            )
            .route(&format!("{ADMIN_PREFIX}/contexts"), get(contexts_handler::<H>));
    }

    let app = app.fallback(dispatch_handler::<H>).with_state(state);

    if config.enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
    request: Request,
) -> Response {
    let Some(_guard) = InFlightGuard::enter(&state.in_flight, state.config.max_in_flight) else {
        warn!("Request rejected: in-flight limit reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read request body: {e}");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request = DispatchRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        remote_addr,
    };

    match state.handler.handle_request(request).await {
        Ok(response) => into_http_response(response),
        Err(e) => error_response(&e),
    }
}

async fn health_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "inFlight": state.in_flight.load(Ordering::Relaxed),
    }))
}

async fn interceptors_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(state.handler.interceptors())
}

async fn contexts_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(state.handler.contexts())
}

async fn get_rules_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    let rules = state.handler.rules().unwrap_or_default();
    Json(rules.to_json())
}

async fn put_rules_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
    Json(body): Json<Value>,
) -> Response {
    let result = HandlerRules::from_json(&body).and_then(|rules| state.handler.replace_rules(rules));
    match result {
        Ok(chain) => {
            info!("Handler rules replaced via admin endpoint");
            Json(chain).into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Counts a request as in flight for as long as it is alive.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, limit: Option<usize>) -> Option<Self> {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        if limit.is_some_and(|max| previous >= max) {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { counter })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn into_http_response(response: DispatchResponse) -> Response {
    let (status, headers, body) = response.into_parts();
    let mut http_response = Response::new(Body::from(body));
    *http_response.status_mut() = status;
    *http_response.headers_mut() = headers;
    http_response
}

fn error_response(error: &DispatchError) -> Response {
    let status = error.status_code();
    if status.is_server_error() {
        warn!("Dispatch failed: {error}");
    } else {
        debug!("Dispatch failed: {error}");
    }
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
