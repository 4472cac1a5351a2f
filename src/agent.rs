//! Agent I/O adapter: translates one active run into the chosen agent's
//! on-the-wire dialect and yields a lazy sequence of JSON events.
//!
//! Two dialects exist: a spawned CLI emitting newline-delimited JSON on
//! stdout (`cli`), and a persistent JSON-RPC channel to a supervised agent
//! process (`acp`). Both hand every decoded event to the caller's sink
//! immediately; nothing is buffered beyond one line.

mod acp;
mod cli;

pub use acp::run_acp_turn;
pub use cli::run_cli_turn;

use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default wall-clock budget for one turn.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// One decoded event from an agent, ready for the stream persister.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub chunk_type: String,
    pub payload: Value,
    /// Agent-side session identifier, when the event carries one. Stored so
    /// the next turn can resume the agent's own conversation state.
    pub external_session_id: Option<String>,
}

impl AgentEvent {
    pub fn from_payload(payload: Value) -> Self {
        let chunk_type = classify_chunk_type(&payload);
        let external_session_id = extract_session_id(&payload);
        Self {
            chunk_type,
            payload,
            external_session_id,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Success { final_text: Option<String> },
    Cancelled,
}

/// What the adapter can fail with. Malformed JSON lines are not here: they
/// are logged and skipped without aborting the run.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("failed to spawn {binary}: {message}")]
    SpawnFailed { binary: String, message: String },
    #[error("run timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent exited with code {0}")]
    NonZeroExit(i32),
    #[error("could not connect to agent on port {port}: {message}")]
    Connect { port: u16, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Short machine-readable kind for the terminal `streaming_error` event.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::SpawnFailed { .. } => "spawn_failed",
            AdapterError::Timeout(_) => "timeout",
            AdapterError::NonZeroExit(_) => "non_zero_exit",
            AdapterError::Connect { .. } => "connect",
            AdapterError::Protocol(_) => "protocol",
            AdapterError::Io(_) => "io",
        }
    }
}

/// Everything a dialect needs to execute one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub conversation_id: String,
    pub prompt: String,
    pub model: Option<String>,
    /// Named sub-agent profile forwarded to CLIs that support one.
    pub sub_agent: Option<String>,
    pub system_prompt: Option<String>,
    /// Agent-side session to resume, captured from a previous turn.
    pub resume_session: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

/// Map an agent event's `type` field onto the chunk taxonomy. Known kinds
/// pass through; assistant/message shapes collapse to `text`; anything else
/// is kept verbatim as an agent-specific type.
pub fn classify_chunk_type(payload: &Value) -> String {
    match payload.get("type").and_then(Value::as_str) {
        Some(t @ ("system" | "text" | "tool_use" | "tool_result" | "result")) => t.to_string(),
        Some("assistant" | "message" | "agent_message_chunk") => "text".to_string(),
        Some("tool_call") => "tool_use".to_string(),
        Some("tool_call_update") => "tool_result".to_string(),
        Some(other) if !other.is_empty() => other.to_string(),
        _ => "system".to_string(),
    }
}

/// Pull the agent-side session id out of an event, tolerating both naming
/// conventions seen in the wild.
pub fn extract_session_id(payload: &Value) -> Option<String> {
    payload
        .get("session_id")
        .or_else(|| payload.get("sessionId"))
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_known_types_pass_through() {
        for t in ["system", "text", "tool_use", "tool_result", "result"] {
            assert_eq!(classify_chunk_type(&json!({"type": t})), t);
        }
    }

    #[test]
    fn classify_assistant_shapes_as_text() {
        assert_eq!(
            classify_chunk_type(&json!({"type": "assistant", "message": {}})),
            "text"
        );
        assert_eq!(
            classify_chunk_type(&json!({"type": "agent_message_chunk"})),
            "text"
        );
    }

    #[test]
    fn classify_agent_specific_kept_verbatim() {
        assert_eq!(
            classify_chunk_type(&json!({"type": "usage_report"})),
            "usage_report"
        );
    }

    #[test]
    fn classify_missing_type_defaults_to_system() {
        assert_eq!(classify_chunk_type(&json!({"foo": 1})), "system");
        assert_eq!(classify_chunk_type(&json!({"type": ""})), "system");
    }

    #[test]
    fn session_id_both_conventions() {
        assert_eq!(
            extract_session_id(&json!({"session_id": "abc"})).as_deref(),
            Some("abc")
        );
        assert_eq!(
            extract_session_id(&json!({"sessionId": "def"})).as_deref(),
            Some("def")
        );
        assert_eq!(extract_session_id(&json!({"type": "text"})), None);
    }

    #[test]
    fn event_from_payload_extracts_everything() {
        let ev = AgentEvent::from_payload(json!({
            "type": "system",
            "subtype": "init",
            "session_id": "ext-1"
        }));
        assert_eq!(ev.chunk_type, "system");
        assert_eq!(ev.external_session_id.as_deref(), Some("ext-1"));
    }
}
