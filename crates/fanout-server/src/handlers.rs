//! Connection handlers for the Fanout server.
//!
//! This module wires the HTTP surface, the upstream bus and the dispatch
//! loop together and runs one session per WebSocket connection.

use crate::config::{BusKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredBus};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fanout_core::{Dispatcher, MemoryBus, RedisBus, Registry, Session, UpstreamBus};
use fanout_transport::{Connection, WebSocketConnection};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Interval between upstream reconcile passes.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared server state.
pub struct AppState {
    /// The subscription registry.
    pub registry: Arc<Registry>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state around an upstream bus.
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn UpstreamBus>) -> Self {
        Self {
            registry: Arc::new(Registry::with_config(bus, config.registry_config())),
            config,
        }
    }
}

/// Connect the upstream bus selected by the configuration.
///
/// # Errors
///
/// Returns an error if the first connection to the bus fails.
pub async fn connect_bus(config: &Config) -> Result<Arc<dyn UpstreamBus>> {
    let bus: Arc<dyn UpstreamBus> = match config.bus.kind {
        BusKind::Redis => {
            let redis = RedisBus::connect(config.redis_config())
                .await
                .with_context(|| {
                    format!(
                        "Failed to connect to upstream bus at {}:{}",
                        config.bus.host, config.bus.port
                    )
                })?;
            Arc::new(redis)
        }
        BusKind::Memory => Arc::new(MemoryBus::with_capacity(config.bus.event_buffer)),
    };
    info!(bus = bus.name(), "Upstream bus ready");
    Ok(Arc::new(MeteredBus::new(bus)))
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the bus or the listener cannot be set up.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let bus = connect_bus(&config).await?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    serve(listener, Arc::new(AppState::new(config, bus)), shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the bus event stream is unavailable or serving fails.
pub async fn serve<S>(listener: TcpListener, state: Arc<AppState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let events = state
        .registry
        .bus()
        .events()
        .context("Upstream event stream unavailable")?;

    let dispatcher = tokio::spawn(
        Dispatcher::new(state.registry.clone()).run_with(events, metrics::record_fan_out),
    );
    let maintenance = tokio::spawn(maintain(state.registry.clone()));

    let addr = listener.local_addr()?;
    info!("Fanout server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    let registry = state.registry.clone();
    let app = app(state);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutting down, closing {} connections", registry.connection_count());
        registry.close_all();
    })
    .await;

    dispatcher.abort();
    maintenance.abort();
    served?;
    Ok(())
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if state.config.admin.enabled {
        router = router
            .route("/admin/connections", get(connections_handler))
            .route("/admin/channels", get(channels_handler));
    }

    router.with_state(state)
}

/// Periodically repair upstream state and refresh gauges.
async fn maintain(registry: Arc<Registry>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let report = registry.reconcile().await;
        if !report.failed.is_empty() {
            warn!(channels = ?report.failed, "Upstream state still inconsistent");
        }
        metrics::set_registry_stats(&registry.stats());
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bus": state.registry.bus().name(),
        "connections": stats.connection_count,
        "channels": stats.channel_count,
    }))
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.connections())
}

async fn channels_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.channels())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let limit = state.config.limits.max_connections;
    if state.registry.connection_count() >= limit {
        warn!(remote = %addr, limit, "Connection limit reached, refusing upgrade");
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    let started = Instant::now();

    let conn = WebSocketConnection::new(socket, Some(addr));
    debug!(connection = %conn.id(), remote = %addr, "WebSocket connected");

    let session = Session::new(
        conn.id().clone(),
        state.registry.clone(),
        state.config.session_config(),
    );
    let summary = session.run(conn).await;

    metrics::record_session(&summary, started.elapsed());
    metrics::set_registry_stats(&state.registry.stats());
    debug!(connection = %summary.id, reason = ?summary.reason, "WebSocket disconnected");
}
