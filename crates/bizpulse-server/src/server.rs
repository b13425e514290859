//! `RelayServer`: Axum HTTP + `WebSocket` gateway.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bizpulse_settings::ServerSettings;
use bizpulse_telemetry::metrics::{WS_AUTH_FAILURES_TOTAL, WS_REJECTED_TOTAL};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{extract_token, AuthError, TokenAuthenticator};
use crate::bus::{BusinessEvents, EventBus};
use crate::connection::ClientConnection;
use crate::error::ServerError;
use crate::handler::{InboundHandler, NoopInboundHandler};
use crate::health::{self, HealthResponse};
use crate::heartbeat::Heartbeat;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayBridge;
use crate::session::{close_message, run_ws_session, SessionContext};
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<ServerSettings>,
    registry: Arc<ConnectionRegistry>,
    authenticator: Arc<dyn TokenAuthenticator>,
    inbound: Arc<dyn InboundHandler>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    slots: Arc<AtomicUsize>,
    start_time: Instant,
}

/// Relay between the event bus and dashboard `WebSocket`s.
///
/// Construction subscribes the relay to every event kind on `bus`; dropping
/// the server unsubscribes it.
pub struct RelayServer {
    config: Arc<ServerSettings>,
    bus: Arc<EventBus>,
    registry: Arc<ConnectionRegistry>,
    authenticator: Arc<dyn TokenAuthenticator>,
    inbound: Arc<dyn InboundHandler>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
    slots: Arc<AtomicUsize>,
    start_time: Instant,
    _bridge: RelayBridge,
}

impl RelayServer {
    pub fn new(
        config: ServerSettings,
        bus: Arc<EventBus>,
        authenticator: Arc<dyn TokenAuthenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = RelayBridge::new(bus.clone(), registry.clone());
        Self {
            config: Arc::new(config),
            bus,
            registry,
            authenticator,
            inbound: Arc::new(NoopInboundHandler),
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            slots: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
            _bridge: bridge,
        }
    }

    /// Route client → server messages to `handler`.
    #[must_use]
    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.inbound = handler;
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: self.config.clone(),
            registry: self.registry.clone(),
            authenticator: self.authenticator.clone(),
            inbound: self.inbound.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
            slots: self.slots.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind `host:port` and serve until [`shutdown`](Self::shutdown).
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "relay server stopped with error");
            }
        });

        info!(%local_addr, "relay server listening");
        Ok((local_addr, handle))
    }

    /// Stop accepting connections and close every live socket.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        let closing = self.registry.close_all();
        info!(connections = closing, "relay server shutting down");
    }

    /// [`shutdown`](Self::shutdown), then wait up to `deadline` for the
    /// task returned by [`listen`](Self::listen).
    pub async fn shutdown_and_drain(
        &self,
        listener: JoinHandle<()>,
        deadline: Duration,
    ) -> DrainOutcome {
        self.shutdown();
        let outcome = self.shutdown.drain_listener(listener, deadline).await;
        info!(
            ?outcome,
            remaining = self.registry.connection_count(),
            "relay server stopped"
        );
        outcome
    }

    pub fn events(&self) -> BusinessEvents {
        BusinessEvents::new(self.bus.clone())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerSettings {
        &self.config
    }
}

/// Counts upgrades in flight plus live sessions against `max_connections`.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(counter.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(slot) = ConnectionSlot::acquire(&state.slots, state.config.max_connections) else {
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached, refusing upgrade"
        );
        counter!(WS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let token = extract_token(&headers, params.get("token").map(String::as_str));
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, token, slot, state))
}

async fn handle_socket(
    mut socket: WebSocket,
    token: Option<String>,
    _slot: ConnectionSlot,
    state: AppState,
) {
    let resolved = match token {
        Some(token) => state.authenticator.authenticate(&token).await,
        None => Err(AuthError::MissingToken),
    };
    let business_id = match resolved {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "websocket authentication failed");
            counter!(WS_AUTH_FAILURES_TOTAL).increment(1);
            let _ = socket
                .send(close_message(AuthError::CLOSE_CODE, AuthError::CLOSE_REASON))
                .await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(state.config.send_queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(
        business_id,
        tx,
        state.shutdown.child_token(),
    ));
    let ctx = SessionContext {
        registry: state.registry.clone(),
        inbound: state.inbound.clone(),
        heartbeat: Heartbeat::from_secs(
            state.config.heartbeat_interval_secs,
            state.config.heartbeat_timeout_secs,
        ),
    };
    run_ws_session(socket, connection, rx, ctx).await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.connection_count(),
        state.registry.business_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            bizpulse_telemetry::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
