//! `LifelineServer`: axum router plus the tasks that back it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router};
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use lifeline_core::{ConnectionId, JsonCodec, MessageCodec};
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{HealthResponse, health_check};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::heartbeat::HeartbeatMonitor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{InboundFrame, SessionContext, run_session};

/// Frames buffered for the application before new ones are dropped.
const INBOUND_QUEUE: usize = 1024;

#[derive(Clone)]
struct AppState {
    max_connections: usize,
    /// One permit per session, held until the session ends.
    slots: Arc<Semaphore>,
    start_time: Instant,
    session: SessionContext,
}

/// A configured server that has not started listening yet.
pub struct LifelineServer {
    config: ServerConfig,
    monitor: Arc<HeartbeatMonitor>,
    registry: Arc<ConnectionRegistry>,
    codec: Arc<dyn MessageCodec>,
    shutdown: Arc<ShutdownCoordinator>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Option<mpsc::Receiver<InboundFrame>>,
    start_time: Instant,
}

impl LifelineServer {
    /// Create a server speaking the default JSON control frames.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    /// Create a server using `codec` for probes and frame classification.
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn MessageCodec>) -> Self {
        let monitor = Arc::new(HeartbeatMonitor::with_codec(
            config.heartbeat_interval,
            config.heartbeat_timeout,
            codec.clone(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            config,
            monitor,
            registry: Arc::new(ConnectionRegistry::new()),
            codec,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            start_time: Instant::now(),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Heartbeat monitor shared with every session.
    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Take the receiver for application frames. Only the first call
    /// returns `Some`.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound_rx.take()
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            max_connections: self.config.max_connections,
            slots: Arc::new(Semaphore::new(self.config.max_connections)),
            start_time: self.start_time,
            session: SessionContext {
                monitor: self.monitor.clone(),
                registry: self.registry.clone(),
                codec: self.codec.clone(),
                inbound: self.inbound_tx.clone(),
                outbound_queue: self.config.outbound_queue,
                shutdown: self.shutdown.token(),
            },
        };
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Bind the listener, then spawn the heartbeat monitor and the accept
    /// loop.
    pub async fn start(mut self) -> Result<ServerHandle, ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let monitor_task = self.monitor.spawn(token.clone());
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(
            %local_addr,
            heartbeat_interval_ms = self.config.heartbeat_interval.as_millis(),
            heartbeat_timeout_ms = self.config.heartbeat_timeout.as_millis(),
            max_connections = self.config.max_connections,
            "lifeline server listening"
        );

        Ok(ServerHandle {
            local_addr,
            shutdown_timeout: self.config.shutdown_timeout,
            monitor: self.monitor.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            inbound: self.inbound_rx.take(),
            tasks: vec![monitor_task, serve_task],
        })
    }
}

/// A running server.
///
/// Dropping the handle signals shutdown without waiting; call
/// [`stop`](Self::stop) to wait for the tasks to drain.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_timeout: std::time::Duration,
    monitor: Arc<HeartbeatMonitor>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the upgrade endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Heartbeat monitor.
    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Take the receiver for application frames, unless it was taken before
    /// the server started.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound.take()
    }

    /// Queue a frame for one client.
    pub fn send_to(&self, id: &ConnectionId, frame: Vec<u8>) -> bool {
        self.registry.send_to(id, frame)
    }

    /// Queue a frame for every client.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        self.registry.broadcast(frame)
    }

    /// Whether shutdown has been signalled.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Stop the monitor, close every session and wait for the listener to
    /// drain.
    pub async fn stop(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        let drained = self
            .shutdown
            .graceful_shutdown(tasks, Some(self.shutdown_timeout))
            .await;
        info!(drained, "lifeline server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(
        state.start_time,
        state.session.registry.len(),
        state.session.monitor.len(),
    ))
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(slot) = state.slots.clone().try_acquire_owned() else {
        warn!(
            connections = state.session.registry.len(),
            max = state.max_connections,
            "connection limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let id = ConnectionId::new();
    let ctx = state.session.clone();
    ws.on_upgrade(move |socket| async move {
        run_session(socket, id, ctx).await;
        drop(slot);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use assert_matches::assert_matches;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> LifelineServer {
        LifelineServer::new(ServerConfig::default().ephemeral())
    }

    #[test]
    fn starts_empty() {
        let server = make_server();
        assert!(server.monitor().is_empty());
        assert!(server.registry().is_empty());
        assert!(!server.shutdown().is_shutting_down());
    }

    #[test]
    fn inbound_taken_once() {
        let mut server = make_server();
        assert!(server.take_inbound().is_some());
        assert!(server.take_inbound().is_none());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server().router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["monitored"], 0);
    }

    #[tokio::test]
    async fn plain_get_on_ws_is_rejected() {
        let app = make_server().router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn full_server_refuses_with_503() {
        let server = LifelineServer::new(ServerConfig::default().ephemeral().with_max_connections(0));
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();

        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn rejected_upgrade_releases_its_slot() {
        let app = LifelineServer::new(ServerConfig::default().ephemeral().with_max_connections(1))
            .router();
        for _ in 0..3 {
            let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert!(resp.status().is_client_error());
        }
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server().router();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_stops() {
        let handle = make_server().start().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.ws_url().ends_with("/ws"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ServerConfig::default().ephemeral();
        config.port = taken.local_addr().unwrap().port();

        let result = LifelineServer::new(config).start().await;
        assert_matches!(result, Err(ServerError::Bind { .. }));
    }
}
