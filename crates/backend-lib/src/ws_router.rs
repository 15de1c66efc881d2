// ============================
// duet-backend-lib/src/ws_router.rs
// ============================
//! HTTP routes and WebSocket connection handling.
use crate::error::AppError;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION, WS_DISCONNECTION};
use crate::websocket::WebSocketHandler;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the router: `/ws`, `/health` and `/sessions`
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "peers": state.hub.len(),
    }))
}

async fn sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let snapshot = state.coordinator.snapshot().await?;
    Ok(Json(snapshot))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let handler = WebSocketHandler::new(state);
    let mut outbound = match handler.open() {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(error = %e, "refusing connection");
            return;
        },
    };

    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);
    let peer_id = handler.peer_id();
    tracing::info!(%peer_id, "websocket connected");

    let (mut tx, mut rx) = socket.split();

    // Forward everything addressed to this peer, in order
    let send_task = tokio::spawn(async move {
        while let Some(server_msg) = outbound.recv().await {
            let json = match serde_json::to_string(&server_msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(%peer_id, error = %e, "failed to serialize message");
                    continue;
                },
            };
            if tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%peer_id, error = %e, "websocket read failed");
                break;
            },
        };
        let result = match message {
            Message::Text(text) => handler.handle_text(text.as_str()).await,
            Message::Binary(bytes) => handler.handle_binary(&bytes),
            Message::Close(_) => break,
            _ => Ok(()),
        };
        if let Err(e) = result {
            handler.reply_error(&e);
        }
    }

    handler.close();
    send_task.abort();

    counter!(WS_DISCONNECTION).increment(1);
    gauge!(WS_ACTIVE).decrement(1.0);
    tracing::info!(%peer_id, "websocket disconnected");
}
