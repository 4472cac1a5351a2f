//! Request/response DTOs and the error-to-status mapping shared by the HTTP
//! façade and the RPC dispatcher.

use crate::db::DbError;
use crate::scheduler::SchedulerError;
use crate::supervisor::SupervisorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================
// Errors
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ResourceExhausted(String),
    Unavailable(String),
    Internal(String),
}

impl AppError {
    /// Numeric code shared by the HTTP surface and the RPC `e.c` field.
    pub fn code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) => 409,
            AppError::ResourceExhausted(_) => 429,
            AppError::Unavailable(_) => 503,
            AppError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::BadRequest(m)
            | AppError::NotFound(m)
            | AppError::Conflict(m)
            | AppError::ResourceExhausted(m)
            | AppError::Unavailable(m)
            | AppError::Internal(m) => m,
        }
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(_)
            | DbError::MessageNotFound(_)
            | DbError::SessionNotFound(_)
            | DbError::RunNotFound(_) => AppError::NotFound(e.to_string()),
            DbError::Conflict(_) => AppError::Conflict(e.to_string()),
            DbError::Sqlite(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Db(db) => db.into(),
            SchedulerError::NoActiveExecution(_) => AppError::NotFound(e.to_string()),
            SchedulerError::QueueFull(_) => AppError::ResourceExhausted(e.to_string()),
        }
    }
}

impl From<SupervisorError> for AppError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::UnknownAgent(_) => AppError::NotFound(e.to_string()),
            SupervisorError::Unavailable(_) => AppError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.message(), "Internal error");
        }
        let body = Json(ErrorResponse {
            error: self.message().to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================
// Requests
// ============================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub agent_id: String,
    pub title: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub sub_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub sub_agent: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ChunksQuery {
    /// Unix milliseconds; only chunks created at or after this instant.
    pub since: Option<i64>,
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub messages: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct ChunkListResponse {
    pub chunks: Vec<Value>,
}
