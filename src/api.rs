//! REST API server for the chat agent
//!
//! Chat turns stream back as Server-Sent Events; the read endpoints return
//! the usual JSON wrapper.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::agent::ChatAgent;
use crate::error::AgentError;
use crate::models::Message;
use crate::streaming::{StreamEvent, StreamWriter};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<ChatAgent>,
}

/// =============================
/// Helpers
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

/// Storage key for a conversation. UUIDs pass through; any other name maps
/// to the same derived UUID every time.
pub fn conversation_key(raw: &str) -> String {
    let raw = raw.trim();
    match uuid::Uuid::parse_str(raw) {
        Ok(id) => id.to_string(),
        Err(_) => stable_uuid_from_string(raw).to_string(),
    }
}

fn error_response(status: StatusCode, error: &AgentError) -> Response {
    (status, Json(ApiResponse::error(error.to_string()))).into_response()
}

/// =============================
/// Health + Configuration
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn check_api_key(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": state.agent.config().has_api_key()
    }))
}

/// =============================
/// Chat Endpoint (SSE)
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Response {
    if let Err(e) = state.agent.ensure_configured() {
        warn!(error = %e, "Rejecting chat turn");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
    }

    let conversation_id = conversation_key(&conversation_id);
    info!(conversation_id = %conversation_id, messages = req.messages.len(), "Chat request");

    let (writer, rx) = StreamWriter::channel(64);
    let cancel = CancellationToken::new();
    // Dropped together with the response body, so a disconnect cancels the turn.
    let disconnect_guard = cancel.clone().drop_guard();

    let agent = state.agent.clone();
    tokio::spawn(async move {
        let result = agent
            .on_chat_message(&conversation_id, req.messages, &writer, &cancel)
            .await;

        match result {
            Ok(_) => {}
            Err(AgentError::Cancelled) => {
                info!(conversation_id = %conversation_id, "Chat turn cancelled");
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "Chat turn failed");
                writer
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    });

    let events = ReceiverStream::new(rx)
        .map(move |event| {
            let _guard = &disconnect_guard;
            Event::default().json_data(&event)
        })
        .chain(stream::once(async {
            Ok::<_, axum::Error>(Event::default().data("[DONE]"))
        }));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// =============================
/// Read Endpoints
/// =============================

async fn list_messages(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.agent.messages(&conversation_key(&conversation_id)).await {
        Ok(messages) => (StatusCode::OK, Json(ApiResponse::success(messages))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn list_memories(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.agent.memories(&conversation_key(&conversation_id)).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::success(entries))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn list_schedules(
    State(state): State<ApiState>,
    Path(conversation_id): Path<String>,
) -> Json<ApiResponse> {
    let tasks = state
        .agent
        .scheduled_tasks(&conversation_key(&conversation_id))
        .await;
    Json(ApiResponse::success(tasks))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// =============================
/// Router
/// =============================

pub fn create_router(agent: Arc<ChatAgent>) -> Router {
    let state = ApiState { agent };

    Router::new()
        .route("/health", get(health))
        .route("/agents/check-api-key", get(check_api_key))
        .route("/agents/chat/:conversation_id", post(chat_handler))
        .route("/agents/chat/:conversation_id/messages", get(list_messages))
        .route("/agents/chat/:conversation_id/memories", get(list_memories))
        .route("/agents/chat/:conversation_id/schedules", get(list_schedules))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    agent: Arc<ChatAgent>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(agent);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
