//! RPC method dispatch for the `{r, m, p}` WebSocket protocol.
//!
//! `thread.*` is an alias surface over conversations, and `thread.run.*`
//! over runs; both resolve to the same handlers.

use super::types::AppError;
use super::AppState;
use crate::db::{Conversation, ConversationPatch, MessageRole, RunFilter, RunStatus};
use crate::events::BusEvent;
use crate::scheduler::{SendMessage, SendOutcome};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::Duration;

/// Default and ceiling for `run.wait` long polls.
const WAIT_DEFAULT: Duration = Duration::from_secs(30);
const WAIT_MAX: Duration = Duration::from_secs(120);

/// Look up and execute one method. Unknown methods are a 404.
pub async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, AppError> {
    // The thread surface is the conversation surface under another name.
    let method = match method {
        "thread.ls" => "conv.ls",
        "thread.new" => "conv.new",
        "thread.get" => "conv.get",
        "thread.upd" => "conv.upd",
        "thread.del" => "conv.del",
        "thread.full" => "conv.full",
        "thread.chunks" => "conv.chunks",
        "thread.cancel" => "conv.cancel",
        "thread.inject" => "conv.inject",
        "thread.run.new" => "run.new",
        "thread.run.get" => "run.get",
        "thread.run.del" => "run.del",
        "thread.run.resume" => "run.resume",
        "thread.run.cancel" => "run.cancel",
        "thread.run.search" => "run.search",
        "thread.run.wait" => "run.wait",
        "thread.run.stream" => "run.stream",
        other => other,
    };

    match method {
        "conv.ls" => conv_ls(state),
        "conv.new" => conv_new(state, &params),
        "conv.get" => conv_get(state, &params),
        "conv.upd" => conv_upd(state, &params),
        "conv.del" => conv_del(state, &params),
        "conv.full" => conv_full(state, &params),
        "conv.chunks" | "msg.stream" => conv_chunks(state, &params),
        "conv.cancel" => conv_cancel(state, &params),
        "conv.inject" => conv_inject(state, &params),
        "msg.ls" => msg_ls(state, &params),
        "msg.send" => msg_send(state, params).await,
        "msg.get" => msg_get(state, &params),
        "q.ls" => q_ls(state, &params),
        "q.del" => q_del(state, &params),
        "q.upd" => q_upd(state, &params),
        "run.new" => run_new(state, params).await,
        "run.get" => run_get(state, &params),
        "run.del" => run_del(state, &params),
        "run.resume" => run_resume(state, &params).await,
        "run.cancel" => run_cancel(state, &params),
        "run.search" => run_search(state, &params),
        "run.wait" => run_wait(state, &params).await,
        "run.stream" => run_stream(state, &params),
        "agent.ls" => Ok(json!({ "agents": state.supervisor.status().await })),
        "agent.restart" => agent_restart(state, &params).await,
        "agent.models" => agent_models(state, &params).await,
        unknown => Err(AppError::NotFound(format!("unknown method: {unknown}"))),
    }
}

// ============================================================
// Param helpers
// ============================================================

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, AppError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing required param: {key}")))
}

fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn since_param(params: &Value) -> Option<DateTime<Utc>> {
    params
        .get("since")
        .and_then(Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
}

/// Serialize a conversation with `isStreaming` reconciled against the
/// scheduler's live set.
pub(super) fn conversation_wire(state: &AppState, conv: &Conversation) -> Value {
    let mut v = serde_json::to_value(conv).unwrap_or_default();
    let live = state.scheduler.is_active(&conv.id);
    if let Some(obj) = v.as_object_mut() {
        obj.insert("isStreaming".to_string(), Value::Bool(live));
    }
    v
}

// ============================================================
// Conversations
// ============================================================

fn conv_ls(state: &AppState) -> Result<Value, AppError> {
    let conversations = state.db.list_conversations()?;
    let wire: Vec<Value> = conversations
        .iter()
        .map(|c| conversation_wire(state, c))
        .collect();
    Ok(json!({ "conversations": wire }))
}

fn conv_new(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let agent_id = str_param(params, "agentId")?;
    if crate::supervisor::find_agent(agent_id).is_none() {
        return Err(AppError::BadRequest(format!("unknown agent: {agent_id}")));
    }
    let title = opt_str(params, "title")
        .unwrap_or_else(|| format!("Conversation {}", Utc::now().format("%Y-%m-%d %H:%M")));
    let cwd = opt_str(params, "cwd").or_else(|| state.config.startup_cwd.clone());

    let conv = state.db.create_conversation(
        agent_id,
        &title,
        cwd.as_deref(),
        opt_str(params, "model").as_deref(),
        opt_str(params, "subAgent").as_deref(),
    )?;

    let wire = conversation_wire(state, &conv);
    state.bus.publish(BusEvent::ConversationCreated {
        conversation: wire.clone(),
    });
    Ok(json!({ "conversation": wire }))
}

fn conv_get(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let conv = state.db.get_conversation(str_param(params, "id")?)?;
    Ok(json!({ "conversation": conversation_wire(state, &conv) }))
}

fn conv_upd(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    let patch = ConversationPatch {
        title: opt_str(params, "title"),
        model: opt_str(params, "model"),
        sub_agent: opt_str(params, "subAgent"),
        cwd: opt_str(params, "cwd"),
    };
    if patch.is_empty() {
        return Err(AppError::BadRequest("empty patch".to_string()));
    }
    let conv = state.db.update_conversation(id, &patch)?;
    let wire = conversation_wire(state, &conv);
    state.bus.publish(BusEvent::ConversationUpdated {
        conversation: wire.clone(),
    });
    Ok(json!({ "conversation": wire }))
}

fn conv_del(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    if state.scheduler.is_active(id) {
        return Err(AppError::Conflict(format!(
            "conversation {id} has an active execution"
        )));
    }
    state.db.delete_conversation(id)?;
    state.bus.publish(BusEvent::ConversationDeleted {
        conversation_id: id.to_string(),
    });
    Ok(json!({ "deleted": true }))
}

fn conv_full(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    let conv = state.db.get_conversation(id)?;
    let messages = state.db.list_messages(id, 100, 0)?;
    let queue = state.scheduler.queue_snapshot(id);
    Ok(json!({
        "conversation": conversation_wire(state, &conv),
        "messages": messages,
        "queue": queue,
    }))
}

fn conv_chunks(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = params
        .get("id")
        .or_else(|| params.get("conversationId"))
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("missing required param: id".to_string()))?;
    // A typed absence beats an empty list for unknown conversations.
    state.db.get_conversation(id)?;
    let chunks = state.db.list_chunks(id, since_param(params))?;
    Ok(json!({ "chunks": chunks }))
}

fn conv_cancel(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    state.scheduler.cancel(id)?;
    Ok(json!({ "cancelled": true }))
}

/// Insert a message without starting a turn (operator notes, tool banners).
fn conv_inject(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    let content = str_param(params, "content")?;
    let role = params
        .get("role")
        .and_then(Value::as_str)
        .map_or(MessageRole::System, MessageRole::parse);
    let message = state.db.create_message(id, role, content, None)?;
    state.bus.publish(BusEvent::MessageCreated {
        conversation_id: id.to_string(),
        message: serde_json::to_value(&message).unwrap_or_default(),
    });
    Ok(json!({ "message": message }))
}

// ============================================================
// Messages
// ============================================================

fn msg_ls(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let conv_id = str_param(params, "conversationId")?;
    state.db.get_conversation(conv_id)?;
    let limit = params.get("limit").and_then(Value::as_i64).unwrap_or(100);
    let offset = params.get("offset").and_then(Value::as_i64).unwrap_or(0);
    let messages = state.db.list_messages(conv_id, limit, offset)?;
    Ok(json!({ "messages": messages }))
}

async fn msg_send(state: &AppState, params: Value) -> Result<Value, AppError> {
    let conv_id = str_param(&params, "conversationId")?.to_string();
    let content = str_param(&params, "content")?.to_string();
    let outcome = state
        .scheduler
        .send_message(SendMessage {
            conversation_id: conv_id,
            content,
            agent_id: opt_str(&params, "agentId"),
            model: opt_str(&params, "model"),
            sub_agent: opt_str(&params, "subAgent"),
            idempotency_key: opt_str(&params, "idempotencyKey"),
        })
        .await?;
    Ok(send_outcome_wire(&outcome))
}

pub(super) fn send_outcome_wire(outcome: &SendOutcome) -> Value {
    match outcome {
        SendOutcome::Started {
            message,
            run_id,
            session_id,
        } => json!({
            "queued": false,
            "message": message,
            "runId": run_id,
            "sessionId": session_id,
        }),
        SendOutcome::Queued {
            message,
            run_id,
            position,
        } => json!({
            "queued": true,
            "queuePosition": position,
            "message": message,
            "runId": run_id,
        }),
        SendOutcome::Duplicate { message } => json!({
            "queued": false,
            "duplicate": true,
            "message": message,
        }),
    }
}

fn msg_get(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let message = state.db.get_message(str_param(params, "id")?)?;
    Ok(json!({ "message": message }))
}

// ============================================================
// Queue
// ============================================================

fn q_ls(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let conv_id = str_param(params, "conversationId")?;
    state.db.get_conversation(conv_id)?;
    let queue = state.scheduler.queue_snapshot(conv_id);
    let length = queue.len();
    Ok(json!({ "queue": queue, "length": length }))
}

fn q_del(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let conv_id = str_param(params, "conversationId")?;
    let turn_id = str_param(params, "messageId")?;
    state.scheduler.remove_queued(conv_id, turn_id)?;
    Ok(json!({ "deleted": true }))
}

fn q_upd(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let conv_id = str_param(params, "conversationId")?;
    let turn_id = str_param(params, "messageId")?;
    let content = str_param(params, "content")?;
    let turn = state.scheduler.update_queued(conv_id, turn_id, content)?;
    Ok(json!({ "turn": turn }))
}

// ============================================================
// Runs
// ============================================================

/// `run.new` starts a turn like `msg.send`; without a thread it creates one
/// implicitly so the run has somewhere to stream.
async fn run_new(state: &AppState, params: Value) -> Result<Value, AppError> {
    let agent_id = str_param(&params, "agentId")?.to_string();
    let content = params
        .pointer("/input/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::BadRequest("missing required param: input.content".to_string()))?
        .to_string();

    let thread_id = match opt_str(&params, "threadId") {
        Some(id) => {
            state.db.get_conversation(&id)?;
            id
        }
        None => {
            if crate::supervisor::find_agent(&agent_id).is_none() {
                return Err(AppError::BadRequest(format!("unknown agent: {agent_id}")));
            }
            let title: String = content.chars().take(64).collect();
            let conv = state.db.create_conversation(
                &agent_id,
                &title,
                state.config.startup_cwd.as_deref(),
                None,
                None,
            )?;
            state.bus.publish(BusEvent::ConversationCreated {
                conversation: conversation_wire(state, &conv),
            });
            conv.id
        }
    };

    let outcome = state
        .scheduler
        .send_message(SendMessage {
            conversation_id: thread_id.clone(),
            content,
            agent_id: Some(agent_id),
            model: None,
            sub_agent: None,
            idempotency_key: opt_str(&params, "idempotencyKey"),
        })
        .await?;

    let run_id = match &outcome {
        SendOutcome::Started { run_id, .. } | SendOutcome::Queued { run_id, .. } => run_id.clone(),
        SendOutcome::Duplicate { .. } => {
            return Err(AppError::Conflict("duplicate run submission".to_string()))
        }
    };
    let run = state.db.get_run(&run_id)?;
    let mut wire = send_outcome_wire(&outcome);
    if let Some(obj) = wire.as_object_mut() {
        obj.insert("run".to_string(), serde_json::to_value(&run).unwrap_or_default());
        obj.insert("threadId".to_string(), Value::String(thread_id));
    }
    Ok(wire)
}

fn run_get(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let run = state.db.get_run(str_param(params, "id")?)?;
    Ok(json!({ "run": run }))
}

fn run_del(state: &AppState, params: &Value) -> Result<Value, AppError> {
    state.db.delete_run(str_param(params, "id")?)?;
    Ok(json!({ "deleted": true }))
}

/// Re-submit a terminal run's input as a fresh run on the same thread.
async fn run_resume(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let run = state.db.get_run(str_param(params, "id")?)?;
    if !run.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "run {} is still {}",
            run.id, run.status
        )));
    }
    let Some(thread_id) = run.thread_id.clone() else {
        return Err(AppError::BadRequest(format!(
            "run {} has no thread to resume into",
            run.id
        )));
    };
    let outcome = state
        .scheduler
        .send_message(SendMessage {
            conversation_id: thread_id,
            content: run.input.content.clone(),
            agent_id: Some(run.agent_id.clone()),
            model: None,
            sub_agent: None,
            idempotency_key: None,
        })
        .await?;
    Ok(send_outcome_wire(&outcome))
}

fn run_cancel(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let run = state.scheduler.cancel_run(str_param(params, "id")?)?;
    Ok(json!({ "run": run }))
}

fn run_search(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let filter = RunFilter {
        status: opt_str(params, "status").map(|s| RunStatus::parse(&s)),
        agent_id: opt_str(params, "agentId"),
        thread_id: opt_str(params, "threadId"),
    };
    let runs = state.db.search_runs(&filter)?;
    Ok(json!({ "runs": runs }))
}

async fn run_wait(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let id = str_param(params, "id")?;
    let timeout = params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map_or(WAIT_DEFAULT, Duration::from_millis)
        .min(WAIT_MAX);
    let run = state.scheduler.wait_for_run(id, timeout).await?;
    Ok(json!({ "run": run, "done": run.status.is_terminal() }))
}

/// Catch-up read over the run's thread chunk log; live traffic belongs to
/// the subscription channel.
fn run_stream(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let run = state.db.get_run(str_param(params, "id")?)?;
    let Some(thread_id) = run.thread_id else {
        return Ok(json!({ "chunks": [] }));
    };
    let chunks = state.db.list_chunks(&thread_id, since_param(params))?;
    Ok(json!({ "chunks": chunks }))
}

// ============================================================
// Agents
// ============================================================

async fn agent_restart(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let agent_id = str_param(params, "id")?;
    let port = state.supervisor.restart(agent_id).await?;
    Ok(json!({ "restarted": true, "port": port }))
}

async fn agent_models(state: &AppState, params: &Value) -> Result<Value, AppError> {
    let agent_id = str_param(params, "id")?;
    Ok(json!({ "models": state.supervisor.query_models(agent_id).await }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Database;
    use crate::events::EventBus;
    use crate::scheduler::{RunScheduler, TurnContext, TurnRunner};
    use crate::stream::StreamPersister;
    use crate::supervisor::Supervisor;
    use crate::agent::{AdapterError, AgentEvent, TurnOutcome};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct EchoRunner {
        persister: StreamPersister,
    }

    #[async_trait]
    impl TurnRunner for EchoRunner {
        async fn run_turn(
            &self,
            turn: &TurnContext,
            _cancel: CancellationToken,
        ) -> Result<TurnOutcome, AdapterError> {
            let mut sink = self
                .persister
                .sink(turn.session_id.clone(), turn.conversation_id.clone());
            sink(AgentEvent::from_payload(json!({"type": "text", "echo": turn.content})));
            Ok(TurnOutcome::Success {
                final_text: Some(format!("echo: {}", turn.content)),
            })
        }
    }

    fn state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let runner = EchoRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));
        AppState::new(
            db,
            bus,
            scheduler,
            Supervisor::new(),
            Arc::new(ServerConfig::default()),
        )
    }

    async fn new_conversation(state: &AppState) -> String {
        let result = dispatch(state, "conv.new", json!({"agentId": "claude-code"}))
            .await
            .unwrap();
        result["conversation"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn unknown_method_is_404() {
        let state = state();
        let err = dispatch(&state, "nope.nope", json!({})).await.unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn missing_param_is_400() {
        let state = state();
        let err = dispatch(&state, "conv.get", json!({})).await.unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn unknown_id_is_404() {
        let state = state();
        let err = dispatch(&state, "conv.get", json!({"id": "missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn conv_lifecycle_over_rpc() {
        let state = state();
        let id = new_conversation(&state).await;

        let listed = dispatch(&state, "conv.ls", json!({})).await.unwrap();
        assert_eq!(listed["conversations"].as_array().unwrap().len(), 1);

        let updated = dispatch(
            &state,
            "conv.upd",
            json!({"id": id, "title": "renamed"}),
        )
        .await
        .unwrap();
        assert_eq!(updated["conversation"]["title"], "renamed");

        let deleted = dispatch(&state, "conv.del", json!({"id": id})).await.unwrap();
        assert_eq!(deleted["deleted"], true);
    }

    #[tokio::test]
    async fn thread_aliases_resolve() {
        let state = state();
        let result = dispatch(&state, "thread.new", json!({"agentId": "claude-code"}))
            .await
            .unwrap();
        let id = result["conversation"]["id"].as_str().unwrap().to_string();
        let fetched = dispatch(&state, "thread.get", json!({"id": id}))
            .await
            .unwrap();
        assert_eq!(fetched["conversation"]["id"], id.as_str());

        // Every conv op answers under its thread.* name
        let chunks = dispatch(&state, "thread.chunks", json!({"id": id}))
            .await
            .unwrap();
        assert!(chunks["chunks"].as_array().unwrap().is_empty());
        let injected = dispatch(
            &state,
            "thread.inject",
            json!({"id": id, "content": "note"}),
        )
        .await
        .unwrap();
        assert_eq!(injected["message"]["role"], "system");

        // And the run surface answers under thread.run.*
        let started = dispatch(
            &state,
            "thread.run.new",
            json!({"agentId": "claude-code", "threadId": id, "input": {"content": "go"}}),
        )
        .await
        .unwrap();
        let run_id = started["run"]["id"].as_str().unwrap().to_string();
        let waited = dispatch(
            &state,
            "thread.run.wait",
            json!({"id": run_id, "timeoutMs": 5000}),
        )
        .await
        .unwrap();
        assert_eq!(waited["done"], true);
        let found = dispatch(&state, "thread.run.search", json!({"threadId": id}))
            .await
            .unwrap();
        assert_eq!(found["runs"].as_array().unwrap().len(), 1);
        let streamed = dispatch(&state, "thread.run.stream", json!({"id": run_id}))
            .await
            .unwrap();
        assert!(!streamed["chunks"].as_array().unwrap().is_empty());
        let resumed = dispatch(&state, "thread.run.resume", json!({"id": run_id}))
            .await
            .unwrap();
        assert_eq!(resumed["queued"], false);
        let deleted = dispatch(&state, "thread.run.del", json!({"id": run_id}))
            .await
            .unwrap();
        assert_eq!(deleted["deleted"], true);
    }

    #[tokio::test]
    async fn msg_send_and_chunks_roundtrip() {
        let state = state();
        let id = new_conversation(&state).await;

        let sent = dispatch(
            &state,
            "msg.send",
            json!({"conversationId": id, "content": "ping", "idempotencyKey": "k1"}),
        )
        .await
        .unwrap();
        assert_eq!(sent["queued"], false);
        let run_id = sent["runId"].as_str().unwrap();

        let waited = dispatch(
            &state,
            "run.wait",
            json!({"id": run_id, "timeoutMs": 5000}),
        )
        .await
        .unwrap();
        assert_eq!(waited["done"], true);
        assert_eq!(waited["run"]["status"], "success");

        let chunks = dispatch(&state, "conv.chunks", json!({"id": id, "since": 0}))
            .await
            .unwrap();
        assert_eq!(chunks["chunks"].as_array().unwrap().len(), 1);

        // Idempotent resend over RPC
        let resent = dispatch(
            &state,
            "msg.send",
            json!({"conversationId": id, "content": "ping", "idempotencyKey": "k1"}),
        )
        .await
        .unwrap();
        assert_eq!(resent["duplicate"], true);
        assert_eq!(resent["message"]["id"], sent["message"]["id"]);
    }

    #[tokio::test]
    async fn run_new_without_thread_creates_one() {
        let state = state();
        let result = dispatch(
            &state,
            "run.new",
            json!({"agentId": "claude-code", "input": {"content": "do the thing"}}),
        )
        .await
        .unwrap();
        let thread_id = result["threadId"].as_str().unwrap();
        let fetched = dispatch(&state, "conv.get", json!({"id": thread_id}))
            .await
            .unwrap();
        assert_eq!(fetched["conversation"]["agentId"], "claude-code");
    }

    #[tokio::test]
    async fn cancel_terminal_run_is_409() {
        let state = state();
        let id = new_conversation(&state).await;
        let sent = dispatch(
            &state,
            "msg.send",
            json!({"conversationId": id, "content": "ping"}),
        )
        .await
        .unwrap();
        let run_id = sent["runId"].as_str().unwrap();
        dispatch(&state, "run.wait", json!({"id": run_id, "timeoutMs": 5000}))
            .await
            .unwrap();

        let err = dispatch(&state, "run.cancel", json!({"id": run_id}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 409);
    }

    #[tokio::test]
    async fn conv_cancel_without_execution_is_404() {
        let state = state();
        let id = new_conversation(&state).await;
        let err = dispatch(&state, "conv.cancel", json!({"id": id}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn inject_creates_system_message() {
        let state = state();
        let id = new_conversation(&state).await;
        let injected = dispatch(
            &state,
            "conv.inject",
            json!({"id": id, "content": "maintenance note"}),
        )
        .await
        .unwrap();
        assert_eq!(injected["message"]["role"], "system");

        let messages = dispatch(&state, "msg.ls", json!({"conversationId": id}))
            .await
            .unwrap();
        assert_eq!(messages["messages"].as_array().unwrap().len(), 1);
    }
}
