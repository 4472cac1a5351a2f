//! HTTP façade: thin read/write endpoints mirroring the common RPC calls.
//! No business logic of its own — everything goes through the same store,
//! scheduler and event bus the RPC surface uses.

use super::rpc::{conversation_wire, send_outcome_wire};
use super::sse::stream_conversation;
use super::types::{
    AppError, ChunkListResponse, ChunksQuery, ConversationListResponse,
    CreateConversationRequest, MessageListResponse, MessagesQuery, SendMessageRequest,
};
use super::ws::ws_handler;
use super::AppState;
use crate::events::BusEvent;
use crate::scheduler::SendMessage;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Create the API router, nested under the configured base URL.
pub fn create_router(state: AppState) -> Router {
    let base = state.config.base_url.clone();
    let api = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/chunks", get(list_chunks))
        .route("/api/conversations/:id/stream", get(stream_conversation))
        .route("/api/agents", get(agent_status))
        .route("/api/runs/:id", get(get_run))
        // WebSocket upgrade for the RPC + subscription channel
        .route("/sync", get(ws_handler))
        .route("/version", get(get_version))
        .with_state(state);

    if base == "/" || base.is_empty() {
        api
    } else {
        Router::new().nest(&base, api)
    }
}

// ============================================================
// Conversations
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state.db.list_conversations()?;
    Ok(Json(ConversationListResponse {
        conversations: conversations
            .iter()
            .map(|c| conversation_wire(&state, c))
            .collect(),
    }))
}

async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Value>, AppError> {
    if crate::supervisor::find_agent(&req.agent_id).is_none() {
        return Err(AppError::BadRequest(format!(
            "unknown agent: {}",
            req.agent_id
        )));
    }
    let title = req
        .title
        .unwrap_or_else(|| format!("Conversation {}", Utc::now().format("%Y-%m-%d %H:%M")));
    let cwd = req.cwd.or_else(|| state.config.startup_cwd.clone());

    let conv = state.db.create_conversation(
        &req.agent_id,
        &title,
        cwd.as_deref(),
        req.model.as_deref(),
        req.sub_agent.as_deref(),
    )?;

    let wire = conversation_wire(&state, &conv);
    state.bus.publish(BusEvent::ConversationCreated {
        conversation: wire.clone(),
    });
    Ok(Json(serde_json::json!({ "conversation": wire })))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let conv = state.db.get_conversation(&id)?;
    Ok(Json(
        serde_json::json!({ "conversation": conversation_wire(&state, &conv) }),
    ))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if state.scheduler.is_active(&id) {
        return Err(AppError::Conflict(format!(
            "conversation {id} has an active execution"
        )));
    }
    state.db.delete_conversation(&id)?;
    state.bus.publish(BusEvent::ConversationDeleted {
        conversation_id: id,
    });
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ============================================================
// Messages
// ============================================================

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessageListResponse>, AppError> {
    state.db.get_conversation(&id)?;
    let messages = state.db.list_messages(
        &id,
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    )?;
    Ok(Json(MessageListResponse {
        messages: messages
            .into_iter()
            .map(|m| serde_json::to_value(m).unwrap_or_default())
            .collect(),
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Value>, AppError> {
    if req.content.trim().is_empty() {
        return Err(AppError::BadRequest("content cannot be empty".to_string()));
    }
    let outcome = state
        .scheduler
        .send_message(SendMessage {
            conversation_id: id,
            content: req.content,
            agent_id: req.agent_id,
            model: req.model,
            sub_agent: req.sub_agent,
            idempotency_key: req.idempotency_key,
        })
        .await?;
    Ok(Json(send_outcome_wire(&outcome)))
}

// ============================================================
// Chunk log
// ============================================================

async fn list_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChunksQuery>,
) -> Result<Json<ChunkListResponse>, AppError> {
    state.db.get_conversation(&id)?;
    let since = query.since.and_then(DateTime::from_timestamp_millis);
    let chunks = state.db.list_chunks(&id, since)?;
    Ok(Json(ChunkListResponse {
        chunks: chunks
            .into_iter()
            .map(|c| serde_json::to_value(c).unwrap_or_default())
            .collect(),
    }))
}

// ============================================================
// Agents & Runs
// ============================================================

async fn agent_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "agents": state.supervisor.status().await }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let run = state.db.get_run(&id)?;
    Ok(Json(serde_json::json!({ "run": run })))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("gmgui ", env!("CARGO_PKG_VERSION"))
}
