//! Persistent ACP dialect: newline-delimited JSON-RPC 2.0 over a TCP
//! connection to the supervised agent process.
//!
//! A turn is one `session/prompt` call. `session/update` notifications become
//! chunks until the response to the prompt request id arrives; the response's
//! stop reason decides the outcome.

use super::{AdapterError, AgentEvent, TurnOutcome, TurnRequest};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// How long to wait for the agent to acknowledge a cancel before giving up.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

const PROMPT_REQUEST_ID: i64 = 3;

/// Execute one turn over JSON-RPC against the agent listening on `port`.
pub async fn run_acp_turn(
    port: u16,
    req: &TurnRequest,
    sink: &mut (dyn FnMut(AgentEvent) + Send),
    cancel: &CancellationToken,
) -> Result<TurnOutcome, AdapterError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|e| AdapterError::Connect {
            port,
            message: e.to_string(),
        })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Handshake once per connection.
    send(
        &mut write_half,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "protocolVersion": 1, "clientCapabilities": {} }
        }),
    )
    .await?;
    wait_for_response(&mut lines, 1).await?;

    // Reuse the agent-side session when a previous turn captured one.
    let session_id = match &req.resume_session {
        Some(sid) => sid.clone(),
        None => {
            let cwd = req
                .cwd
                .as_ref()
                .map_or_else(|| "/".to_string(), |p| p.display().to_string());
            send(
                &mut write_half,
                &json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "session/new",
                    "params": { "cwd": cwd, "mcpServers": [] }
                }),
            )
            .await?;
            let result = wait_for_response(&mut lines, 2).await?;
            result
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    AdapterError::Protocol("session/new response without sessionId".to_string())
                })?
        }
    };

    send(
        &mut write_half,
        &json!({
            "jsonrpc": "2.0",
            "id": PROMPT_REQUEST_ID,
            "method": "session/prompt",
            "params": {
                "sessionId": session_id,
                "prompt": [{ "type": "text", "text": req.prompt }]
            }
        }),
    )
    .await?;

    let deadline = tokio::time::sleep(req.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = send(
                    &mut write_half,
                    &json!({
                        "jsonrpc": "2.0",
                        "method": "session/cancel",
                        "params": { "sessionId": session_id }
                    }),
                )
                .await;
                // Give the agent a moment to acknowledge, then stop waiting.
                let acknowledged = tokio::time::timeout(CANCEL_GRACE, async {
                    while let Some(msg) = next_message(&mut lines).await {
                        if message_id(&msg) == Some(PROMPT_REQUEST_ID) {
                            break;
                        }
                    }
                })
                .await;
                if acknowledged.is_err() {
                    tracing::debug!(session = %req.session_id, "Agent did not acknowledge cancel in time");
                }
                return Ok(TurnOutcome::Cancelled);
            }
            () = &mut deadline => {
                return Err(AdapterError::Timeout(req.timeout));
            }
            msg = next_message(&mut lines) => {
                let Some(msg) = msg else {
                    return Err(AdapterError::Protocol("connection closed mid-turn".to_string()));
                };
                if msg.get("method").and_then(Value::as_str) == Some("session/update") {
                    if let Some(update) = msg.pointer("/params/update") {
                        let chunk_type = classify_acp_update(update);
                        sink(AgentEvent {
                            chunk_type,
                            payload: update.clone(),
                            external_session_id: Some(session_id.clone()),
                        });
                    }
                    continue;
                }
                if message_id(&msg) == Some(PROMPT_REQUEST_ID) {
                    if let Some(err) = msg.get("error") {
                        return Err(AdapterError::Protocol(err.to_string()));
                    }
                    let stop_reason = msg
                        .pointer("/result/stopReason")
                        .and_then(Value::as_str)
                        .unwrap_or("end_turn");
                    return if stop_reason == "cancelled" {
                        Ok(TurnOutcome::Cancelled)
                    } else {
                        Ok(TurnOutcome::Success { final_text: None })
                    };
                }
                // Requests from the agent (permission prompts etc.) are out of
                // scope here; answer nothing and keep streaming.
            }
        }
    }
}

/// Map ACP update discriminators onto the chunk taxonomy.
fn classify_acp_update(update: &Value) -> String {
    match update.get("sessionUpdate").and_then(Value::as_str) {
        Some("agent_message_chunk" | "agent_thought_chunk") => "text".to_string(),
        Some("tool_call") => "tool_use".to_string(),
        Some("tool_call_update") => "tool_result".to_string(),
        Some(other) if !other.is_empty() => other.to_string(),
        _ => "system".to_string(),
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &Value) -> Result<(), AdapterError> {
    let mut line = msg.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Next well-formed JSON message; malformed lines are logged and skipped.
async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Option<Value> {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(v) => return Some(v),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unparseable ACP line");
                    }
                }
            }
            Ok(None) | Err(_) => return None,
        }
    }
}

fn message_id(msg: &Value) -> Option<i64> {
    msg.get("id").and_then(Value::as_i64)
}

/// Read messages until the response to `id` arrives; notifications received
/// before the handshake completes are dropped.
async fn wait_for_response(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    id: i64,
) -> Result<Value, AdapterError> {
    while let Some(msg) = next_message(lines).await {
        if message_id(&msg) == Some(id) {
            if let Some(err) = msg.get("error") {
                return Err(AdapterError::Protocol(err.to_string()));
            }
            return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
        }
    }
    Err(AdapterError::Protocol(format!(
        "connection closed waiting for response {id}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DEFAULT_RUN_TIMEOUT;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[test]
    fn acp_update_classification() {
        assert_eq!(
            classify_acp_update(&json!({"sessionUpdate": "agent_message_chunk"})),
            "text"
        );
        assert_eq!(
            classify_acp_update(&json!({"sessionUpdate": "tool_call"})),
            "tool_use"
        );
        assert_eq!(
            classify_acp_update(&json!({"sessionUpdate": "tool_call_update"})),
            "tool_result"
        );
        assert_eq!(classify_acp_update(&json!({"sessionUpdate": "plan"})), "plan");
        assert_eq!(classify_acp_update(&json!({})), "system");
    }

    /// Scripted fake agent: answers the handshake, streams two updates, then
    /// completes the prompt.
    async fn fake_agent(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
            let reply = match method {
                "initialize" => Some(json!({
                    "jsonrpc": "2.0", "id": msg["id"], "result": { "protocolVersion": 1 }
                })),
                "session/new" => Some(json!({
                    "jsonrpc": "2.0", "id": msg["id"], "result": { "sessionId": "acp-sess-1" }
                })),
                "session/prompt" => {
                    for i in 0..2 {
                        let update = json!({
                            "jsonrpc": "2.0",
                            "method": "session/update",
                            "params": {
                                "sessionId": "acp-sess-1",
                                "update": {
                                    "sessionUpdate": "agent_message_chunk",
                                    "content": { "type": "text", "text": format!("part {i}") }
                                }
                            }
                        });
                        let mut s = update.to_string();
                        s.push('\n');
                        write_half.write_all(s.as_bytes()).await.unwrap();
                    }
                    Some(json!({
                        "jsonrpc": "2.0", "id": msg["id"], "result": { "stopReason": "end_turn" }
                    }))
                }
                _ => None,
            };
            if let Some(reply) = reply {
                let mut s = reply.to_string();
                s.push('\n');
                write_half.write_all(s.as_bytes()).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn full_turn_against_scripted_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_agent(listener));

        let req = TurnRequest {
            session_id: "s1".to_string(),
            conversation_id: "c1".to_string(),
            prompt: "hello".to_string(),
            model: None,
            sub_agent: None,
            system_prompt: None,
            resume_session: None,
            cwd: Some(std::path::PathBuf::from("/tmp")),
            timeout: DEFAULT_RUN_TIMEOUT,
        };
        let cancel = CancellationToken::new();
        let mut events = Vec::new();

        let outcome = run_acp_turn(port, &req, &mut |e| events.push(e), &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Success { .. }));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.chunk_type == "text"));
        assert_eq!(events[0].external_session_id.as_deref(), Some("acp-sess-1"));
    }

    #[tokio::test]
    async fn connect_refused_is_typed() {
        let req = TurnRequest {
            session_id: "s1".to_string(),
            conversation_id: "c1".to_string(),
            prompt: "hello".to_string(),
            model: None,
            sub_agent: None,
            system_prompt: None,
            resume_session: None,
            cwd: None,
            timeout: DEFAULT_RUN_TIMEOUT,
        };
        let cancel = CancellationToken::new();
        // Port 1 is essentially never listening on loopback.
        let result = run_acp_turn(1, &req, &mut |_| {}, &cancel).await;
        assert!(matches!(result, Err(AdapterError::Connect { .. })));
    }
}
