//! WebSocket gateway: per-client connection lifecycle, inbound dispatch and
//! the subscription-filtered outbound fan-out.
//!
//! Each connection owns a reader loop (this module) and a writer task that
//! exclusively holds the socket's send half and drives the outbound
//! pipeline. Other components never touch the socket; they enqueue through
//! the client's channel.

use super::pipeline::{encode_batch, EnqueueAction, OutboundPipeline, WireFrames};
use super::rpc;
use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::events::BusEvent;

/// Interval between server-initiated latency pings.
const PING_INTERVAL: Duration = Duration::from_secs(10);

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKind {
    Session,
    Conversation,
}

/// Traffic into a connection's writer task.
#[derive(Debug)]
enum Outbound {
    /// Goes through the batching pipeline.
    Event(Value),
    /// Bypasses batching: RPC replies, pongs, control frames.
    Direct(Value),
    /// Protocol-level pong for a client ping frame.
    Pong(Vec<u8>),
    /// Measured round trip to fold into the latency tier.
    Rtt(u64),
}

struct ClientHandle {
    subscriptions: HashSet<(SubKind, String)>,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// All connected clients and their subscriptions. One writer-friendly lock;
/// the router snapshots receivers before sending.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<u64, ClientHandle>>,
}

impl ClientRegistry {
    fn register(&self, id: u64, tx: mpsc::UnboundedSender<Outbound>) {
        self.clients.write().unwrap().insert(
            id,
            ClientHandle {
                subscriptions: HashSet::new(),
                tx,
            },
        );
    }

    fn unregister(&self, id: u64) {
        self.clients.write().unwrap().remove(&id);
    }

    fn subscribe(&self, id: u64, kind: SubKind, key: String) {
        if let Some(client) = self.clients.write().unwrap().get_mut(&id) {
            client.subscriptions.insert((kind, key));
        }
    }

    fn unsubscribe(&self, id: u64, kind: SubKind, key: &str) {
        if let Some(client) = self.clients.write().unwrap().get_mut(&id) {
            client.subscriptions.remove(&(kind, key.to_string()));
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Deliver one bus event to every client whose subscriptions match.
    /// Broadcast types bypass filtering entirely.
    fn route(&self, event: &BusEvent, wire: &Value) {
        let targets: Vec<mpsc::UnboundedSender<Outbound>> = {
            let clients = self.clients.read().unwrap();
            clients
                .values()
                .filter(|client| wants(event, &client.subscriptions))
                .map(|client| client.tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(Outbound::Event(wire.clone()));
        }
    }
}

/// Subscription filter: session-scoped events reach clients watching that
/// session or its conversation; conversation-scoped events reach the
/// conversation's watchers.
fn wants(event: &BusEvent, subscriptions: &HashSet<(SubKind, String)>) -> bool {
    if event.is_broadcast() {
        return true;
    }
    if let Some(session_id) = event.session_id() {
        if subscriptions.contains(&(SubKind::Session, session_id.to_string())) {
            return true;
        }
    }
    if let Some(conv_id) = event.conversation_id() {
        if subscriptions.contains(&(SubKind::Conversation, conv_id.to_string())) {
            return true;
        }
    }
    false
}

/// Bus event to wire shape: snake_case `type`, camelCase fields.
pub fn event_to_wire(event: &BusEvent) -> Value {
    match event {
        BusEvent::ConversationCreated { conversation } => {
            json!({ "type": "conversation_created", "conversation": conversation })
        }
        BusEvent::ConversationUpdated { conversation } => {
            json!({ "type": "conversation_updated", "conversation": conversation })
        }
        BusEvent::ConversationDeleted { conversation_id } => {
            json!({ "type": "conversation_deleted", "conversationId": conversation_id })
        }
        BusEvent::MessageCreated {
            conversation_id,
            message,
        } => json!({
            "type": "message_created",
            "conversationId": conversation_id,
            "message": message
        }),
        BusEvent::StreamingStart {
            session_id,
            conversation_id,
            agent_id,
        } => json!({
            "type": "streaming_start",
            "sessionId": session_id,
            "conversationId": conversation_id,
            "agentId": agent_id
        }),
        BusEvent::StreamingChunk {
            session_id,
            conversation_id,
            sequence,
            chunk_type,
            payload,
        } => json!({
            "type": "streaming_chunk",
            "sessionId": session_id,
            "conversationId": conversation_id,
            "sequence": sequence,
            "chunkType": chunk_type,
            "payload": payload
        }),
        BusEvent::StreamingComplete {
            session_id,
            conversation_id,
            interrupted,
        } => json!({
            "type": "streaming_complete",
            "sessionId": session_id,
            "conversationId": conversation_id,
            "interrupted": interrupted
        }),
        BusEvent::StreamingError {
            session_id,
            conversation_id,
            error,
        } => json!({
            "type": "streaming_error",
            "sessionId": session_id,
            "conversationId": conversation_id,
            "error": error
        }),
        BusEvent::StreamingCancelled {
            session_id,
            conversation_id,
        } => json!({
            "type": "streaming_cancelled",
            "sessionId": session_id,
            "conversationId": conversation_id
        }),
        BusEvent::RunCancelled {
            run_id,
            conversation_id,
        } => json!({
            "type": "run_cancelled",
            "runId": run_id,
            "conversationId": conversation_id
        }),
        BusEvent::QueueStatus {
            conversation_id,
            length,
        } => json!({
            "type": "queue_status",
            "conversationId": conversation_id,
            "queueLength": length
        }),
    }
}

/// Forward everything from the event bus into the per-client channels.
/// Spawned once at startup.
pub fn spawn_broadcast_router(state: &AppState) {
    let bus = state.bus.clone();
    let clients = state.clients.clone();
    tokio::spawn(async move {
        let mut rx = bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let wire = event_to_wire(&event);
                    clients.route(&event, &wire);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Broadcast router lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ============================================================
// Connection lifecycle
// ============================================================

/// HTTP handler for `GET <base>/sync`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    state.clients.register(client_id, tx.clone());
    tracing::debug!(client_id, "WebSocket client connected");

    let (sender, mut receiver) = socket.split();
    let writer = tokio::spawn(write_loop(sender, rx));

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, client_id, &text, &tx),
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Outbound::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary frames from clients are ignored
            Err(e) => {
                tracing::debug!(client_id, error = %e, "WebSocket recv error");
                break;
            }
        }
    }

    // Drop the client from the index; the writer exits once every sender is
    // gone, draining nothing further.
    state.clients.unregister(client_id);
    drop(tx);
    let _ = writer.await;
    tracing::debug!(client_id, "WebSocket client disconnected");
}

/// One inbound text frame: an RPC request, a subscription event, or a
/// latency control message.
fn handle_frame(
    state: &AppState,
    client_id: u64,
    text: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        tracing::debug!(client_id, "Ignoring unparseable frame");
        return;
    };

    // Request shape: { r, m, p }
    if let (Some(request_id), Some(method)) = (
        frame.get("r").and_then(Value::as_str),
        frame.get("m").and_then(Value::as_str),
    ) {
        let params = frame.get("p").cloned().unwrap_or_else(|| json!({}));
        let state = state.clone();
        let tx = tx.clone();
        let request_id = request_id.to_string();
        let method = method.to_string();
        // Dispatched off the reader loop so a long poll (run.wait) does not
        // starve other frames on this connection.
        tokio::spawn(async move {
            let reply = match rpc::dispatch(&state, &method, params).await {
                Ok(result) => json!({ "r": request_id, "d": result }),
                Err(e) => json!({ "r": request_id, "e": { "c": e.code(), "m": e.message() } }),
            };
            let _ = tx.send(Outbound::Direct(reply));
        });
        return;
    }

    // Legacy event shape: { type, ... }
    match frame.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            if let Some(session_id) = frame.get("sessionId").and_then(Value::as_str) {
                state
                    .clients
                    .subscribe(client_id, SubKind::Session, session_id.to_string());
            }
            if let Some(conv_id) = frame.get("conversationId").and_then(Value::as_str) {
                state
                    .clients
                    .subscribe(client_id, SubKind::Conversation, conv_id.to_string());
            }
        }
        Some("unsubscribe") => {
            if let Some(session_id) = frame.get("sessionId").and_then(Value::as_str) {
                state.clients.unsubscribe(client_id, SubKind::Session, session_id);
            }
            if let Some(conv_id) = frame.get("conversationId").and_then(Value::as_str) {
                state
                    .clients
                    .unsubscribe(client_id, SubKind::Conversation, conv_id);
            }
        }
        Some("ping") => {
            let request_id = frame.get("requestId").cloned().unwrap_or(Value::Null);
            let _ = tx.send(Outbound::Direct(
                json!({ "type": "pong", "requestId": request_id }),
            ));
        }
        Some("pong") => {
            // Reply to our latency ping; requestId carries the send time.
            if let Some(sent_ms) = frame
                .get("requestId")
                .and_then(Value::as_str)
                .and_then(|s| s.strip_prefix("lat-"))
                .and_then(|s| s.parse::<i64>().ok())
            {
                let rtt = Utc::now().timestamp_millis().saturating_sub(sent_ms);
                if rtt >= 0 {
                    let _ = tx.send(Outbound::Rtt(u64::try_from(rtt).unwrap_or(0)));
                }
            }
        }
        other => {
            tracing::debug!(client_id, event_type = ?other, "Ignoring unknown event frame");
        }
    }
}

/// Exclusive owner of the socket's send half. Applies the outbound pipeline
/// and the compression step.
async fn write_loop(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut pipeline = OutboundPipeline::new(Instant::now());
    let mut flush_at: Option<tokio::time::Instant> = None;
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else { break };
                match outbound {
                    Outbound::Direct(value) => {
                        let text = value.to_string();
                        pipeline.record_sent_bytes(text.len(), Instant::now());
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Pong(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Rtt(ms) => pipeline.record_rtt(ms),
                    Outbound::Event(value) => {
                        match pipeline.enqueue(value, Instant::now()) {
                            EnqueueAction::FlushNow(batch) => {
                                if send_batch(&mut sender, &mut pipeline, &batch).await.is_err() {
                                    break;
                                }
                                flush_at = pipeline
                                    .reschedule()
                                    .map(|d| tokio::time::Instant::now() + d);
                            }
                            EnqueueAction::ScheduleIn(delay) => {
                                flush_at = Some(tokio::time::Instant::now() + delay);
                            }
                            EnqueueAction::Pending | EnqueueAction::Dropped => {}
                        }
                    }
                }
            }
            () = async {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let batch = pipeline.flush_due();
                if !batch.is_empty()
                    && send_batch(&mut sender, &mut pipeline, &batch).await.is_err()
                {
                    break;
                }
                flush_at = pipeline
                    .reschedule()
                    .map(|d| tokio::time::Instant::now() + d);
            }
            _ = ping_timer.tick() => {
                let ping = json!({
                    "type": "ping",
                    "requestId": format!("lat-{}", Utc::now().timestamp_millis())
                });
                if sender.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_batch(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    pipeline: &mut OutboundPipeline,
    batch: &[Value],
) -> Result<(), axum::Error> {
    let frames = encode_batch(batch);
    pipeline.record_sent_bytes(frames.wire_len(), Instant::now());
    match frames {
        WireFrames::Text(text) => sender.send(Message::Text(text)).await,
        WireFrames::Compressed { control, payload } => {
            sender.send(Message::Text(control)).await?;
            sender.send(Message::Binary(payload)).await
        }
    }
}
