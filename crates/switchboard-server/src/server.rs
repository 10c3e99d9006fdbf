use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use switchboard_engine::Orchestrator;
use switchboard_store::Database;
use switchboard_telemetry::TelemetryGuard;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-client outbound queue; messages beyond it are dropped.
    pub max_send_queue: usize,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            max_send_queue: 256,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and spawn the server, event bridge, RPC processor
/// and dead-client cleanup.
pub async fn start(
    config: ServerConfig,
    orchestrator: Orchestrator,
    db: Database,
    telemetry: Option<Arc<TelemetryGuard>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge = event_bridge::create_bridge(Arc::clone(&client_registry), orchestrator.subscribe());
    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), config.cleanup_interval);

    let mut handler_state = HandlerState::new(orchestrator, db, Arc::clone(&client_registry));
    if let Some(telemetry) = telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }
    let handler_state = Arc::new(handler_state);

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
    ));

    let router = build_router(AppState {
        handler_state,
        client_registry,
        message_tx: msg_tx,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "switchboard server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server exited");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        tasks: vec![server, bridge, rpc, cleanup],
    })
}

/// Handle returned by `start()`; owns the background tasks.
pub struct ServerHandle {
    pub port: u16,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    client::handle_ws_connection(socket, client_id, rx, state.client_registry, state.message_tx).await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::health(&state.handler_state, None);
    let result = resp.result.unwrap_or_default();

    let http_status = if result.get("status").and_then(|s| s.as_str()) == Some("healthy") {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(result))
}

/// Process RPC requests from WebSocket clients, one at a time.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let response = match serde_json::from_str::<RpcRequest>(&raw_message) {
            Ok(request) => {
                let params = request.params.unwrap_or_else(|| serde_json::json!({}));
                tracing::debug!(client_id = %client_id, method = %request.method, "rpc request");
                handlers::dispatch(&state, Some(&client_id), &request.method, &params, request.id).await
            }
            Err(_) => RpcResponse::parse_error(),
        };

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_engine::loopback::LoopbackEngine;
    use switchboard_engine::OrchestratorConfig;

    fn orchestrator(db: &Database) -> Orchestrator {
        Orchestrator::new(Arc::new(LoopbackEngine::new()), db.clone(), OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let db = Database::in_memory().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };

        let handle = start(config, orchestrator(&db), db, None).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live_sessions"], 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn rpc_processor_answers_the_caller() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ClientRegistry::new(32));
        let state = Arc::new(HandlerState::new(orchestrator(&db), db, Arc::clone(&registry)));
        let (client_id, mut client_rx) = registry.register();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(process_rpc_messages(rx, state, Arc::clone(&registry)));

        tx.send((client_id.clone(), "not json".into())).await.unwrap();
        let reply = client_rx.recv().await.unwrap();
        assert!(reply.contains("PARSE_ERROR"));

        tx.send((client_id, r#"{"method":"system.ping","id":3}"#.into()))
            .await
            .unwrap();
        let reply: serde_json::Value = serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["success"], true);

        task.abort();
    }

    #[test]
    fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ClientRegistry::new(32));
        let (message_tx, _) = mpsc::channel(32);
        let state = AppState {
            handler_state: Arc::new(HandlerState::new(orchestrator(&db), db, Arc::clone(&registry))),
            client_registry: registry,
            message_tx,
        };
        let _router = build_router(state);
    }
}
