use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use convoy_store::ChatStore;

use crate::auth::{self, CredentialVerifier};
use crate::config::ServerConfig;
use crate::connection::{self, ConnectionDeps};
use crate::gateway::Gateway;
use crate::registry::{self, ConnectionRegistry};
use crate::resolver::ConversationResolver;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub resolver: Arc<ConversationResolver>,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub heartbeat: Duration,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn ChatStore>,
        verifier: Arc<dyn CredentialVerifier>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            resolver: Arc::new(ConversationResolver::new(Arc::clone(&store))),
            gateway: Arc::new(Gateway::new(Arc::clone(&store), registry)),
            store,
            verifier,
            heartbeat: config.heartbeat_interval(),
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(crate::api::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn ChatStore>,
    verifier: Arc<dyn CredentialVerifier>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let shutdown = CancellationToken::new();

    let sweep = registry::start_sweep_task(Arc::clone(&registry), config.sweep_interval(), shutdown.child_token());

    let state = AppState::new(&config, store, verifier, Arc::clone(&registry), shutdown.clone());
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Convoy server started");

    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "Server exited with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        registry,
        shutdown,
        server,
        sweep,
    })
}

/// Handle returned by `start()`. Owns the registry and background tasks.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sweep: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting, close every live connection and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.registry.clear();
        let _ = self.sweep.await;
        let _ = self.server.await;
        tracing::info!("Convoy server stopped");
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// WebSocket upgrade handler. The credential is checked after the upgrade so
/// a refusal can carry an application close code.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let credential = auth::presented_credential(&headers, query.token.as_deref());
    let deps = ConnectionDeps {
        gateway: Arc::clone(&state.gateway),
        verifier: Arc::clone(&state.verifier),
        heartbeat: state.heartbeat,
        shutdown: state.shutdown.clone(),
    };
    ws.on_upgrade(move |socket| async move {
        let cause = connection::serve_connection(socket, credential, deps).await;
        tracing::debug!(?cause, "WebSocket connection finished");
    })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.gateway.registry().count(),
    }))
}
