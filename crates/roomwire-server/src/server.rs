use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::connection::{self, ConnectionRegistry, Inbound};
use crate::error::ServerError;
use crate::handlers;
use crate::health::{self, HealthResponse};
use crate::registry::{RegistryOptions, RoomRegistry};
use crate::shutdown::ShutdownCoordinator;

const INBOUND_QUEUE: usize = 1024;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub inbound_tx: mpsc::Sender<Inbound>,
    pub shutdown: ShutdownCoordinator,
    pub start_time: Instant,
    pub max_message_size: usize,
}

/// Build the router: liveness at `/`, `/health`, and the WebSocket upgrade
/// at `socket_path`.
pub fn build_router(state: AppState, socket_path: &str) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(socket_path, get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

fn validate_socket_path(path: &str) -> Result<(), ServerError> {
    if path == "/" || path == "/health" {
        return Err(ServerError::Config(format!(
            "socket path {path} collides with a built-in route"
        )));
    }
    if path.contains(['{', '}', '*', ':']) || path.contains(char::is_whitespace) {
        return Err(ServerError::Config(format!(
            "socket path {path} must be a literal path"
        )));
    }
    Ok(())
}

/// Bind, spawn the inbound processor and the HTTP server, and return a
/// handle owning both.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let socket_path = config.normalized_socket_path();
    validate_socket_path(&socket_path)?;

    let connections = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let registry = Arc::new(RoomRegistry::new(
        Arc::clone(&connections),
        RegistryOptions::from(&config),
    ));
    let shutdown = ShutdownCoordinator::new();

    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);
    let processor = tokio::spawn(process_inbound(
        inbound_rx,
        Arc::clone(&registry),
        Arc::clone(&connections),
        config.compat,
        shutdown.token(),
    ));

    let state = AppState {
        registry: Arc::clone(&registry),
        connections: Arc::clone(&connections),
        inbound_tx,
        shutdown: shutdown.clone(),
        start_time: Instant::now(),
        max_message_size: config.max_message_size,
    };
    let router = build_router(state, &socket_path);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    info!(
        addr = %local_addr,
        socket_path = %socket_path,
        compat = config.compat,
        max_message_size = config.max_message_size,
        "roomwire server started"
    );

    let token = shutdown.token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        {
            error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        local_addr,
        socket_path,
        registry,
        connections,
        shutdown,
        tasks: vec![server, processor],
    })
}

/// Handle returned by [`start`]; owns the background tasks.
pub struct ServerHandle {
    local_addr: SocketAddr,
    socket_path: String,
    registry: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    shutdown: ShutdownCoordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Loopback WebSocket URL of this server.
    pub fn socket_url(&self) -> String {
        format!("ws://127.0.0.1:{}{}", self.port(), self.socket_path)
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stop accepting connections, close open sockets and wait for the
    /// background tasks.
    pub async fn shutdown(self) {
        info!("roomwire server shutting down");
        self.shutdown.graceful_shutdown(self.tasks, None).await;
    }
}

async fn root_handler() -> &'static str {
    "Ok"
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.connections.count(),
        state.registry.room_count(),
    ))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (conn, rx) = state.connections.register();
    info!(conn_id = %conn.id, "websocket client connected");

    connection::handle_ws_connection(
        socket,
        conn,
        rx,
        state.inbound_tx,
        state.shutdown.token(),
    )
    .await;
}

/// Single consumer of all inbound traffic, so each event's state change
/// completes before the next one starts.
async fn process_inbound(
    mut rx: mpsc::Receiver<Inbound>,
    registry: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    compat: bool,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };

        match msg {
            Inbound::Frame(conn_id, text) => {
                let Some(conn) = connections.get(&conn_id) else {
                    debug!(conn_id = %conn_id, "frame from unregistered connection");
                    continue;
                };
                handlers::handle_frame(&registry, &conn, &text, compat);
            }
            Inbound::Closed(conn_id) => {
                registry.disconnect(&conn_id);
                let dropped = connections.unregister(&conn_id).map_or(0, |conn| conn.dropped());
                info!(conn_id = %conn_id, dropped, "websocket client disconnected");
            }
        }
    }
    debug!("inbound processor stopped");
}
