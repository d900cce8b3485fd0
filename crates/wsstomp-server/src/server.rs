//! `WsStompServer`: axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use wsstomp_broker::{Authenticator, Broker, DestinationRouter, FixedHeartBeat, SessionPolicy};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection factory and shared router.
    pub broker: Broker,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Open WebSocket connections.
    pub connections: Arc<AtomicUsize>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Flush allowance for a closing socket.
    pub flush_timeout: Duration,
}

/// The wsstomp server.
pub struct WsStompServer {
    config: ServerConfig,
    broker: Broker,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    connections: Arc<AtomicUsize>,
    metrics: Option<PrometheusHandle>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl WsStompServer {
    /// Create a server checking credentials with `authenticator`.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let router = Arc::new(DestinationRouter::new(config.topic_retention));
        let policy = SessionPolicy::new(authenticator, Arc::new(FixedHeartBeat(config.heart_beat)));
        let broker = Broker::new(router, policy, config.broker).with_cancellation(shutdown.token());

        Self {
            config,
            broker,
            shutdown,
            start_time: Instant::now(),
            connections: Arc::new(AtomicUsize::new(0)),
            metrics: None,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            broker: self.broker.clone(),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            connections: Arc::clone(&self.connections),
            metrics: self.metrics.clone(),
            flush_timeout: self.config.flush_timeout,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serve task. Also starts the topic
    /// reclaim sweep when the retention policy asks for one.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        if let Some(sweep) = self
            .broker
            .router()
            .start_reclaim_task(self.config.reclaim_interval, self.shutdown.token())
        {
            info!(interval_ms = millis(self.config.reclaim_interval), "topic reclaim enabled");
            self.background.lock().push(sweep);
        }

        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                error!(error = %err, "server stopped with error");
            }
        });

        info!(addr = %local_addr, heart_beat_ms = millis(self.config.heart_beat), "wsstomp server listening");
        Ok((local_addr, handle))
    }

    /// Hand over tasks started by [`listen`](Self::listen) besides the serve
    /// task, so shutdown can await them too. Both stop on the shutdown token.
    pub fn take_background_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.background.lock())
    }

    /// Connection factory and shared router.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Destination router shared by every connection.
    pub fn destinations(&self) -> &Arc<DestinationRouter> {
        self.broker.router()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_failed_upgrade(|err| tracing::warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.load(Ordering::Relaxed),
        state.broker.router().topic_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
