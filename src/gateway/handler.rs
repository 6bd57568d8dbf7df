//! HTTP and WebSocket handlers
//!
//! REST endpoints let surrounding services create sessions and submit
//! prompts. The WebSocket endpoint is the transport: each connection
//! subscribes to conversations and receives their event envelopes.

use crate::agent::hub::TransportSender;
use crate::agent::types::{TransportCommand, TransportReply};
use crate::agent::AgentBridge;
use crate::error::Error;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for gateway handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<AgentBridge>,
    /// Outbound queue depth per WebSocket transport
    pub transport_buffer: usize,
}

/// Create the router with all REST and WebSocket endpoints
pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", delete(close_session))
        .route("/api/sessions/:id/prompt", post(prompt))
        .route("/api/sessions/:id/cancel", post(cancel))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Map a bridge error onto an HTTP response
fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Session(_) => StatusCode::NOT_FOUND,
        Error::ProcessTerminated | Error::Spawn(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Rpc { .. } | Error::ProtocolDecode(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"error": err.to_string(), "code": err.code()})),
    )
        .into_response()
}

// =============================================================================
// REST handlers
// =============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agent_alive": state.bridge.is_agent_alive().await,
    }))
}

/// Create session request body
#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    conversation_id: String,
    cwd: PathBuf,
    #[serde(default)]
    mcp_servers: Vec<Value>,
}

/// Create an agent session for a conversation
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    if !request.cwd.is_absolute() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "cwd must be an absolute path"})),
        )
            .into_response();
    }

    match state
        .bridge
        .create_session(&request.conversation_id, &request.cwd, request.mcp_servers)
        .await
    {
        Ok(session_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "session_id": session_id,
                "conversation_id": request.conversation_id,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Prompt request body
#[derive(Debug, Deserialize)]
struct PromptRequest {
    text: String,
}

/// Submit a prompt; output is streamed to subscribers
async fn prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PromptRequest>,
) -> Response {
    match state.bridge.prompt(&id, &request.text).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"session_id": id})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.bridge.cancel(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.bridge.close_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// WebSocket transport
// =============================================================================

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_transport_ws(socket, state))
}

/// Handle one transport connection.
///
/// Events and acknowledgements share one bounded outbound queue; the hub
/// drops events for this connection when the queue is full.
async fn handle_transport_ws(socket: WebSocket, state: AppState) {
    let transport_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(transport_id = %transport_id, "Transport connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.transport_buffer);

    // Forward hub → transport frames
    let send_transport_id = transport_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                tracing::debug!(transport_id = %send_transport_id, "Transport send failed");
                break;
            }
        }
    });

    // Receive transport commands
    let recv_bridge = state.bridge.clone();
    let recv_transport_id = transport_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_command(&recv_bridge, &recv_transport_id, &tx, &text).await;
                    if let Some(reply) = reply {
                        match serde_json::to_string(&reply) {
                            Ok(frame) => {
                                if tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("Failed to serialize reply: {}", e),
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.bridge.hub().unsubscribe(&transport_id);
    tracing::info!(transport_id = %transport_id, "Transport disconnected");
}

/// Apply one transport command. Returns the acknowledgement to send back.
pub async fn handle_command(
    bridge: &AgentBridge,
    transport_id: &str,
    sender: &TransportSender,
    text: &str,
) -> Option<TransportReply> {
    let command = match serde_json::from_str::<TransportCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            let preview: String = text.chars().take(200).collect();
            tracing::warn!(
                transport_id,
                "Invalid transport command: {} (raw: {})",
                e,
                preview
            );
            return Some(TransportReply::Error {
                message: format!("invalid command: {}", e),
            });
        }
    };

    match command {
        TransportCommand::Subscribe { session_id } => {
            bridge.hub().subscribe(&session_id, transport_id, sender.clone());
            Some(TransportReply::Subscribed { session_id })
        }
        TransportCommand::Unsubscribe { session_id } => {
            bridge.hub().unsubscribe_from(&session_id, transport_id);
            Some(TransportReply::Unsubscribed { session_id })
        }
        TransportCommand::PermissionResponse {
            request_id,
            option_id,
        } => match bridge
            .resolve_permission(&request_id, option_id.as_deref())
            .await
        {
            Ok(()) => None,
            Err(e) => Some(TransportReply::Error {
                message: e.to_string(),
            }),
        },
    }
}
