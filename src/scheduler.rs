//! Run scheduler: serializes user turns per conversation.
//!
//! The scheduler is the exclusive owner of two in-memory maps keyed by
//! conversation — the active executions and the FIFO queues of pending
//! turns — and of every `is_streaming` transition. One mutex guards both
//! maps; nothing does I/O while holding it, so read-then-mutate paths on the
//! same conversation key serialize while different conversations run in
//! parallel.

use crate::agent::{
    run_acp_turn, run_cli_turn, AdapterError, AgentEvent, TurnOutcome, TurnRequest,
};
use crate::db::{
    Database, DbError, MessageRole, Run, RunInput, RunStatus, SessionPatch, SessionStatus,
    ConversationStatus,
};
use crate::events::{BusEvent, EventBus};
use crate::stream::StreamPersister;
use crate::supervisor::{find_agent, AgentDialect, Supervisor};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Soft cap on queued turns per conversation.
const DEFAULT_QUEUE_CAP: usize = 1000;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("No active execution for conversation {0}")]
    NoActiveExecution(String),
    #[error("Queue for conversation {0} is full")]
    QueueFull(String),
}

/// One user turn waiting its time slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTurn {
    pub conversation_id: String,
    pub content: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub run_id: String,
}

/// Everything a runner needs to execute one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub run_id: String,
    pub session_id: String,
    pub conversation_id: String,
    pub agent_id: String,
    pub model: Option<String>,
    pub sub_agent: Option<String>,
    pub content: String,
    pub cwd: Option<PathBuf>,
}

/// Seam between the scheduler and the agent dialects. Production wires the
/// supervisor and the stream persister; tests inject a scripted runner.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run_turn(
        &self,
        turn: &TurnContext,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AdapterError>;
}

/// Parameters of `msg.send`.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub conversation_id: String,
    pub content: String,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub sub_agent: Option<String>,
    pub idempotency_key: Option<String>,
}

/// What `msg.send` produced.
#[derive(Debug)]
pub enum SendOutcome {
    Started {
        message: crate::db::Message,
        run_id: String,
        session_id: String,
    },
    Queued {
        message: crate::db::Message,
        run_id: String,
        position: usize,
    },
    /// The idempotency key matched an earlier send; nothing new happened.
    Duplicate { message: crate::db::Message },
}

struct ActiveExecution {
    run_id: String,
    session_id: Option<String>,
    cancel: CancellationToken,
    #[allow(dead_code)] // surfaced via status endpoints later
    started_at: Instant,
}

#[derive(Default)]
struct SchedulerInner {
    active: HashMap<String, ActiveExecution>,
    queues: HashMap<String, VecDeque<QueuedTurn>>,
}

pub struct RunScheduler {
    db: Database,
    bus: EventBus,
    runner: Arc<dyn TurnRunner>,
    inner: Mutex<SchedulerInner>,
    queue_cap: usize,
}

impl RunScheduler {
    pub fn new(db: Database, bus: EventBus, runner: Arc<dyn TurnRunner>) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            runner,
            inner: Mutex::new(SchedulerInner::default()),
            queue_cap: DEFAULT_QUEUE_CAP,
        })
    }

    #[cfg(test)]
    fn with_queue_cap(
        db: Database,
        bus: EventBus,
        runner: Arc<dyn TurnRunner>,
        queue_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            runner,
            inner: Mutex::new(SchedulerInner::default()),
            queue_cap,
        })
    }

    // ==================== msg.send ====================

    /// Persist the user message (idempotently), then either start the turn or
    /// append it to the conversation's queue.
    pub async fn send_message(
        self: &Arc<Self>,
        params: SendMessage,
    ) -> Result<SendOutcome, SchedulerError> {
        let conv = self.db.get_conversation(&params.conversation_id)?;

        if let Some(key) = &params.idempotency_key {
            if let Some(existing) = self.db.find_message_by_idempotency(&conv.id, key)? {
                tracing::info!(conv_id = %conv.id, key = %key, "Duplicate send; returning original message");
                return Ok(SendOutcome::Duplicate { message: existing });
            }
        }

        let message = self.db.create_message(
            &conv.id,
            MessageRole::User,
            &params.content,
            params.idempotency_key.as_deref(),
        )?;
        self.bus.publish(BusEvent::MessageCreated {
            conversation_id: conv.id.clone(),
            message: serde_json::to_value(&message).unwrap_or_default(),
        });

        let agent_id = params.agent_id.unwrap_or_else(|| conv.agent_id.clone());
        let run = self.db.create_run(
            &agent_id,
            Some(&conv.id),
            &RunInput {
                content: params.content.clone(),
                config: None,
            },
            None,
        )?;

        let turn = QueuedTurn {
            conversation_id: conv.id.clone(),
            content: params.content,
            agent_id,
            model: params.model.or(conv.model),
            sub_agent: params.sub_agent.or(conv.sub_agent),
            message_id: Some(message.id.clone()),
            run_id: run.id.clone(),
        };

        let queued_position = {
            let mut inner = self.inner.lock().unwrap();
            if inner.active.contains_key(&conv.id) {
                let queue = inner.queues.entry(conv.id.clone()).or_default();
                if queue.len() >= self.queue_cap {
                    None // handled below, outside the lock
                } else {
                    queue.push_back(turn.clone());
                    Some(queue.len())
                }
            } else {
                inner.active.insert(
                    conv.id.clone(),
                    ActiveExecution {
                        run_id: run.id.clone(),
                        session_id: None,
                        cancel: CancellationToken::new(),
                        started_at: Instant::now(),
                    },
                );
                Some(0)
            }
        };

        match queued_position {
            Some(0) => {
                let session_id = self.start_reserved(turn).await?;
                Ok(SendOutcome::Started {
                    message,
                    run_id: run.id,
                    session_id,
                })
            }
            Some(position) => {
                self.publish_queue_status(&conv.id);
                Ok(SendOutcome::Queued {
                    message,
                    run_id: run.id,
                    position,
                })
            }
            None => {
                // Queue overflow: the run will never execute.
                let _ = self.db.cancel_run(&run.id);
                Err(SchedulerError::QueueFull(conv.id))
            }
        }
    }

    /// Start a turn whose conversation slot is already reserved in
    /// `active_executions`. On failure the slot is released.
    ///
    /// Returns a manually boxed future (rather than `async fn`) because this
    /// function participates in a call cycle with `drain`/`on_completion`
    /// through the spawned task below; rustc cannot resolve the opaque
    /// `impl Future` type for mutually-recursive async fns, so the cycle is
    /// broken here by erasing the type.
    fn start_reserved(
        self: &Arc<Self>,
        turn: QueuedTurn,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, SchedulerError>> + Send + '_>>
    {
        Box::pin(self.start_reserved_inner(turn))
    }

    async fn start_reserved_inner(
        self: &Arc<Self>,
        turn: QueuedTurn,
    ) -> Result<String, SchedulerError> {
        let conv_id = turn.conversation_id.clone();

        let session = match self.db.create_session(&conv_id, &turn.agent_id) {
            Ok(s) => s,
            Err(e) => {
                self.release_slot(&conv_id);
                return Err(e.into());
            }
        };

        // A cancel may have raced the queue: pending -> cancelled is terminal.
        if let Err(e) = self.db.update_run_status(&turn.run_id, RunStatus::Active) {
            let _ = self.db.update_session(
                &session.id,
                &SessionPatch {
                    status: Some(SessionStatus::Interrupted),
                    completed: true,
                    ..SessionPatch::default()
                },
            );
            self.release_slot(&conv_id);
            return Err(e.into());
        }

        if let Err(e) = self
            .db
            .set_conversation_live(&conv_id, ConversationStatus::Busy, true)
        {
            self.release_slot(&conv_id);
            return Err(e.into());
        }
        let _ = self.db.update_session(
            &session.id,
            &SessionPatch {
                status: Some(SessionStatus::Active),
                ..SessionPatch::default()
            },
        );

        let cancel = {
            let mut inner = self.inner.lock().unwrap();
            let Some(exec) = inner.active.get_mut(&conv_id) else {
                // Slot vanished (shutdown); nothing to run.
                return Err(SchedulerError::NoActiveExecution(conv_id));
            };
            exec.session_id = Some(session.id.clone());
            exec.run_id.clone_from(&turn.run_id);
            exec.cancel.clone()
        };

        self.bus.publish(BusEvent::StreamingStart {
            session_id: session.id.clone(),
            conversation_id: conv_id.clone(),
            agent_id: turn.agent_id.clone(),
        });

        let cwd = self
            .db
            .get_conversation(&conv_id)
            .ok()
            .and_then(|c| c.cwd)
            .map(PathBuf::from);
        let context = TurnContext {
            run_id: turn.run_id.clone(),
            session_id: session.id.clone(),
            conversation_id: conv_id.clone(),
            agent_id: turn.agent_id.clone(),
            model: turn.model.clone(),
            sub_agent: turn.sub_agent.clone(),
            content: turn.content.clone(),
            cwd,
        };

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = scheduler.runner.run_turn(&context, cancel).await;
            scheduler.on_completion(&context, outcome).await;
        });

        Ok(session.id)
    }

    fn release_slot(&self, conv_id: &str) {
        self.inner.lock().unwrap().active.remove(conv_id);
    }

    // ==================== Completion ====================

    /// A turn finished. Record the terminal state, publish the terminal
    /// event, and drain one queued turn if present.
    async fn on_completion(
        self: &Arc<Self>,
        context: &TurnContext,
        outcome: Result<TurnOutcome, AdapterError>,
    ) {
        let conv_id = &context.conversation_id;
        self.release_slot(conv_id);

        match outcome {
            Ok(TurnOutcome::Success { final_text }) => {
                let _ = self.db.update_session(
                    &context.session_id,
                    &SessionPatch {
                        status: Some(SessionStatus::Completed),
                        completed: true,
                        ..SessionPatch::default()
                    },
                );
                self.advance_run(&context.run_id, RunStatus::Success);
                let _ = self.db.set_conversation_live(
                    conv_id,
                    ConversationStatus::Idle,
                    false,
                );
                if let Some(text) = final_text.filter(|t| !t.is_empty()) {
                    if let Ok(message) =
                        self.db
                            .create_message(conv_id, MessageRole::Assistant, &text, None)
                    {
                        self.bus.publish(BusEvent::MessageCreated {
                            conversation_id: conv_id.clone(),
                            message: serde_json::to_value(&message).unwrap_or_default(),
                        });
                    }
                }
                self.bus.publish(BusEvent::StreamingComplete {
                    session_id: context.session_id.clone(),
                    conversation_id: conv_id.clone(),
                    interrupted: false,
                });
            }
            Ok(TurnOutcome::Cancelled) => {
                let _ = self.db.update_session(
                    &context.session_id,
                    &SessionPatch {
                        status: Some(SessionStatus::Interrupted),
                        completed: true,
                        ..SessionPatch::default()
                    },
                );
                self.advance_run(&context.run_id, RunStatus::Cancelled);
                let _ = self.db.set_conversation_live(
                    conv_id,
                    ConversationStatus::Interrupted,
                    false,
                );
                self.bus.publish(BusEvent::StreamingCancelled {
                    session_id: context.session_id.clone(),
                    conversation_id: conv_id.clone(),
                });
                self.bus.publish(BusEvent::StreamingComplete {
                    session_id: context.session_id.clone(),
                    conversation_id: conv_id.clone(),
                    interrupted: true,
                });
            }
            Err(e) => {
                tracing::warn!(conv_id = %conv_id, run_id = %context.run_id, error = %e, "Turn failed");
                let _ = self.db.update_session(
                    &context.session_id,
                    &SessionPatch {
                        status: Some(SessionStatus::Error),
                        error: Some(e.to_string()),
                        completed: true,
                    },
                );
                self.advance_run(&context.run_id, RunStatus::Error);
                let _ = self.db.set_conversation_live(
                    conv_id,
                    ConversationStatus::Idle,
                    false,
                );
                let _ = self
                    .db
                    .create_message(conv_id, MessageRole::Error, &e.to_string(), None);
                self.bus.publish(BusEvent::StreamingError {
                    session_id: context.session_id.clone(),
                    conversation_id: conv_id.clone(),
                    error: format!("{} ({})", e, e.kind()),
                });
            }
        }

        self.drain(conv_id).await;
    }

    /// Run transitions may race an external `run.cancel`; a conflict there
    /// means the terminal state is already recorded.
    fn advance_run(&self, run_id: &str, status: RunStatus) {
        match self.db.update_run_status(run_id, status) {
            Ok(_) | Err(DbError::Conflict(_)) => {}
            Err(e) => tracing::error!(run_id, error = %e, "Failed to record run status"),
        }
    }

    /// Start the next queued turn, skipping turns whose run was cancelled
    /// while waiting.
    async fn drain(self: &Arc<Self>, conv_id: &str) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap();
                if inner.active.contains_key(conv_id) {
                    return;
                }
                let Some(queue) = inner.queues.get_mut(conv_id) else {
                    return;
                };
                let Some(turn) = queue.pop_front() else {
                    inner.queues.remove(conv_id);
                    return;
                };
                inner.active.insert(
                    conv_id.to_string(),
                    ActiveExecution {
                        run_id: turn.run_id.clone(),
                        session_id: None,
                        cancel: CancellationToken::new(),
                        started_at: Instant::now(),
                    },
                );
                turn
            };

            self.publish_queue_status(conv_id);
            match self.start_reserved(next).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(conv_id, error = %e, "Skipping queued turn");
                    // Slot already released; try the next queued turn.
                }
            }
        }
    }

    fn publish_queue_status(&self, conv_id: &str) {
        let length = {
            let inner = self.inner.lock().unwrap();
            inner.queues.get(conv_id).map_or(0, VecDeque::len)
        };
        self.bus.publish(BusEvent::QueueStatus {
            conversation_id: conv_id.to_string(),
            length,
        });
    }

    // ==================== Cancellation ====================

    /// Cancel the in-flight turn of a conversation. `NoActiveExecution` when
    /// nothing is running.
    pub fn cancel(&self, conv_id: &str) -> Result<(), SchedulerError> {
        let token = {
            let inner = self.inner.lock().unwrap();
            inner
                .active
                .get(conv_id)
                .map(|exec| exec.cancel.clone())
        };
        match token {
            Some(token) => {
                tracing::info!(conv_id, "Cancelling active execution");
                token.cancel();
                Ok(())
            }
            None => Err(SchedulerError::NoActiveExecution(conv_id.to_string())),
        }
    }

    /// Cancel through the run state machine; conflicts surface to the caller.
    /// Live executions are interrupted, queued turns are removed.
    pub fn cancel_run(&self, run_id: &str) -> Result<Run, SchedulerError> {
        let run = self.db.cancel_run(run_id)?;

        let (token, removed_from) = {
            let mut inner = self.inner.lock().unwrap();
            let token = inner
                .active
                .values()
                .find(|exec| exec.run_id == run_id)
                .map(|exec| exec.cancel.clone());
            let mut removed_from = None;
            for (conv_id, queue) in &mut inner.queues {
                let before = queue.len();
                queue.retain(|turn| turn.run_id != run_id);
                if queue.len() != before {
                    removed_from = Some(conv_id.clone());
                    break;
                }
            }
            (token, removed_from)
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(conv_id) = &removed_from {
            self.publish_queue_status(conv_id);
        }

        self.bus.publish(BusEvent::RunCancelled {
            run_id: run_id.to_string(),
            conversation_id: run.thread_id.clone(),
        });
        Ok(run)
    }

    // ==================== Queue Inspection ====================

    pub fn queue_snapshot(&self, conv_id: &str) -> Vec<QueuedTurn> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(conv_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one queued turn, addressed by its message or run id.
    pub fn remove_queued(&self, conv_id: &str, turn_id: &str) -> Result<(), SchedulerError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(queue) = inner.queues.get_mut(conv_id) else {
                return Err(SchedulerError::NoActiveExecution(conv_id.to_string()));
            };
            let before = queue.len();
            let mut removed_run = None;
            queue.retain(|turn| {
                let matches = turn.message_id.as_deref() == Some(turn_id) || turn.run_id == turn_id;
                if matches {
                    removed_run = Some(turn.run_id.clone());
                }
                !matches
            });
            (queue.len() != before).then_some(removed_run)
        };

        match removed {
            Some(run_id) => {
                if let Some(run_id) = run_id {
                    let _ = self.db.cancel_run(&run_id);
                }
                self.publish_queue_status(conv_id);
                Ok(())
            }
            None => Err(SchedulerError::NoActiveExecution(format!(
                "no queued turn {turn_id} in conversation {conv_id}"
            ))),
        }
    }

    /// Replace the content of a queued turn before it runs.
    pub fn update_queued(
        &self,
        conv_id: &str,
        turn_id: &str,
        content: &str,
    ) -> Result<QueuedTurn, SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(queue) = inner.queues.get_mut(conv_id) else {
            return Err(SchedulerError::NoActiveExecution(conv_id.to_string()));
        };
        for turn in queue.iter_mut() {
            if turn.message_id.as_deref() == Some(turn_id) || turn.run_id == turn_id {
                turn.content = content.to_string();
                return Ok(turn.clone());
            }
        }
        Err(SchedulerError::NoActiveExecution(format!(
            "no queued turn {turn_id} in conversation {conv_id}"
        )))
    }

    // ==================== Introspection ====================

    pub fn is_active(&self, conv_id: &str) -> bool {
        self.inner.lock().unwrap().active.contains_key(conv_id)
    }

    /// Conversations with a live execution right now. Used to reconcile the
    /// persisted `is_streaming` flag on reads.
    pub fn live_conversations(&self) -> HashSet<String> {
        self.inner
            .lock()
            .unwrap()
            .active
            .keys()
            .cloned()
            .collect()
    }

    // ==================== Long Poll ====================

    /// Wait until the run reaches a terminal state or the timeout elapses;
    /// returns the freshest run either way.
    pub async fn wait_for_run(&self, run_id: &str, timeout: Duration) -> Result<Run, SchedulerError> {
        let mut rx = self.bus.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let run = self.db.get_run(run_id)?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::select! {
                () = &mut deadline => return Ok(run),
                event = rx.recv() => {
                    // Any bus activity (or lag) is a cue to re-check.
                    let _ = event;
                }
            }
        }
    }

    // ==================== Startup & Shutdown ====================

    /// Rebuild the per-conversation queues from runs that were still pending
    /// when the previous process stopped, then start each queue's head.
    pub async fn recover(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let pending = self.db.list_pending_runs()?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::info!(count = pending.len(), "Rebuilding queues from pending runs");

        let mut conversations = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for run in pending {
                let Some(conv_id) = run.thread_id.clone() else {
                    continue;
                };
                let turn = QueuedTurn {
                    conversation_id: conv_id.clone(),
                    content: run.input.content.clone(),
                    agent_id: run.agent_id.clone(),
                    model: None,
                    sub_agent: None,
                    message_id: None,
                    run_id: run.id,
                };
                inner.queues.entry(conv_id.clone()).or_default().push_back(turn);
                if !conversations.contains(&conv_id) {
                    conversations.push(conv_id);
                }
            }
        }

        for conv_id in conversations {
            self.drain(&conv_id).await;
        }
        Ok(())
    }

    /// Cancel every in-flight execution. Queued turns stay pending in the
    /// store and are rebuilt on the next startup.
    pub fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = {
            let inner = self.inner.lock().unwrap();
            inner.active.values().map(|e| e.cancel.clone()).collect()
        };
        tracing::info!(count = tokens.len(), "Cancelling in-flight runs for shutdown");
        for token in tokens {
            token.cancel();
        }
    }
}

// ==================== Production Runner ====================

/// Drives the supervisor plus the dialect adapters, persisting every event
/// through the stream persister.
pub struct AgentTurnRunner {
    supervisor: Arc<Supervisor>,
    persister: StreamPersister,
    /// Agent-side session ids per conversation, so later turns resume the
    /// agent's own history.
    external_sessions: Mutex<HashMap<String, String>>,
    run_timeout: Duration,
}

impl AgentTurnRunner {
    pub fn new(
        supervisor: Arc<Supervisor>,
        persister: StreamPersister,
        run_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            persister,
            external_sessions: Mutex::new(HashMap::new()),
            run_timeout,
        }
    }
}

#[async_trait]
impl TurnRunner for AgentTurnRunner {
    async fn run_turn(
        &self,
        turn: &TurnContext,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AdapterError> {
        let spec = find_agent(&turn.agent_id)
            .ok_or_else(|| AdapterError::Protocol(format!("unknown agent {}", turn.agent_id)))?;

        let resume_session = self
            .external_sessions
            .lock()
            .unwrap()
            .get(&turn.conversation_id)
            .cloned();

        let request = TurnRequest {
            session_id: turn.session_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            prompt: turn.content.clone(),
            model: turn.model.clone(),
            sub_agent: turn.sub_agent.clone(),
            system_prompt: None,
            resume_session,
            cwd: turn.cwd.clone(),
            timeout: self.run_timeout,
        };

        let captured = Arc::new(Mutex::new(None::<String>));
        let captured_in_sink = Arc::clone(&captured);
        let mut persist = self
            .persister
            .sink(turn.session_id.clone(), turn.conversation_id.clone());
        let mut sink = move |event: AgentEvent| {
            if let Some(sid) = &event.external_session_id {
                *captured_in_sink.lock().unwrap() = Some(sid.clone());
            }
            persist(event);
        };

        let outcome = match spec.dialect {
            AgentDialect::StreamJson => {
                self.supervisor.touch(&turn.agent_id).await;
                run_cli_turn(spec, &request, &mut sink, &cancel).await
            }
            AgentDialect::Acp => {
                let port = self
                    .supervisor
                    .ensure_running(&turn.agent_id)
                    .await
                    .map_err(|e| AdapterError::Connect {
                        port: spec.health_port,
                        message: e.to_string(),
                    })?;
                run_acp_turn(port, &request, &mut sink, &cancel).await
            }
        };

        if let Some(sid) = captured.lock().unwrap().clone() {
            self.external_sessions
                .lock()
                .unwrap()
                .insert(turn.conversation_id.clone(), sid);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Conversation;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Scripted runner: emits chunks through the real persister, then waits
    /// for an optional release signal before returning its outcome.
    struct ScriptedRunner {
        persister: StreamPersister,
        chunks: usize,
        hold: Option<Arc<Notify>>,
        outcome: fn() -> Result<TurnOutcome, AdapterError>,
        wait_for_cancel: bool,
    }

    #[async_trait]
    impl TurnRunner for ScriptedRunner {
        async fn run_turn(
            &self,
            turn: &TurnContext,
            cancel: CancellationToken,
        ) -> Result<TurnOutcome, AdapterError> {
            let mut sink = self
                .persister
                .sink(turn.session_id.clone(), turn.conversation_id.clone());
            for i in 0..self.chunks {
                sink(AgentEvent::from_payload(json!({"type": "text", "n": i})));
            }
            if self.wait_for_cancel {
                cancel.cancelled().await;
                return Ok(TurnOutcome::Cancelled);
            }
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            (self.outcome)()
        }
    }

    fn send(conv: &Conversation, content: &str, key: &str) -> SendMessage {
        SendMessage {
            conversation_id: conv.id.clone(),
            content: content.to_string(),
            agent_id: None,
            model: None,
            sub_agent: None,
            idempotency_key: Some(key.to_string()),
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn happy_turn_streams_and_completes() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 3,
            hold: None,
            outcome: || {
                Ok(TurnOutcome::Success {
                    final_text: Some("pong".to_string()),
                })
            },
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));

        let mut rx = bus.subscribe();
        let outcome = scheduler.send_message(send(&conv, "ping", "k1")).await.unwrap();
        let SendOutcome::Started { run_id, session_id, .. } = outcome else {
            panic!("expected immediate start");
        };

        // MessageCreated, StreamingStart, 3 chunks in order, completion.
        let mut sequences = Vec::new();
        let mut saw_start = false;
        let mut saw_complete = false;
        while !saw_complete {
            match rx.recv().await.unwrap() {
                BusEvent::StreamingStart { session_id: s, .. } => {
                    assert_eq!(s, session_id);
                    saw_start = true;
                }
                BusEvent::StreamingChunk { sequence, .. } => sequences.push(sequence),
                BusEvent::StreamingComplete { interrupted, .. } => {
                    assert!(!interrupted);
                    saw_complete = true;
                }
                _ => {}
            }
        }
        assert!(saw_start);
        assert_eq!(sequences, vec![0, 1, 2]);

        wait_until(|| db.get_run(&run_id).unwrap().status == RunStatus::Success).await;
        let conv = db.get_conversation(&conv.id).unwrap();
        assert!(!conv.is_streaming);
        assert!(!scheduler.is_active(&conv.id));

        // Final text became an assistant message
        let messages = db.list_messages(&conv.id, 100, 0).unwrap();
        assert!(messages
            .iter()
            .any(|m| m.role == MessageRole::Assistant && m.content == "pong"));
    }

    #[tokio::test]
    async fn second_send_queues_then_drains() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let hold = Arc::new(Notify::new());
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 1,
            hold: Some(Arc::clone(&hold)),
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));

        let first = scheduler.send_message(send(&conv, "ping", "k1")).await.unwrap();
        assert!(matches!(first, SendOutcome::Started { .. }));

        let second = scheduler.send_message(send(&conv, "pong", "k2")).await.unwrap();
        let SendOutcome::Queued { position, run_id: queued_run, .. } = second else {
            panic!("expected queued outcome");
        };
        assert_eq!(position, 1);
        assert_eq!(scheduler.queue_snapshot(&conv.id).len(), 1);

        // Single-active invariant: still exactly one live execution.
        assert!(scheduler.is_active(&conv.id));
        assert_eq!(scheduler.live_conversations().len(), 1);

        // Release the first turn; the queue drains into a second session.
        hold.notify_one();
        wait_until(|| db.get_run(&queued_run).unwrap().status != RunStatus::Pending).await;
        hold.notify_one();
        wait_until(|| db.get_run(&queued_run).unwrap().status == RunStatus::Success).await;
        assert!(scheduler.queue_snapshot(&conv.id).is_empty());
    }

    #[tokio::test]
    async fn idempotent_resend_starts_nothing() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let hold = Arc::new(Notify::new());
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 0,
            hold: Some(Arc::clone(&hold)),
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));

        let first = scheduler.send_message(send(&conv, "ping", "k1")).await.unwrap();
        let SendOutcome::Started { message, .. } = first else {
            panic!("expected start");
        };

        let second = scheduler.send_message(send(&conv, "ping", "k1")).await.unwrap();
        let SendOutcome::Duplicate { message: dup } = second else {
            panic!("expected duplicate outcome");
        };
        assert_eq!(dup.id, message.id);
        assert_eq!(db.count_messages(&conv.id).unwrap(), 1);
        // No second turn was queued
        assert!(scheduler.queue_snapshot(&conv.id).is_empty());
        hold.notify_one();
    }

    #[tokio::test]
    async fn cancel_interrupts_within_bounded_time() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 1,
            hold: None,
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: true,
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));

        let mut rx = bus.subscribe();
        let outcome = scheduler.send_message(send(&conv, "long", "k1")).await.unwrap();
        let SendOutcome::Started { run_id, session_id, .. } = outcome else {
            panic!("expected start");
        };

        scheduler.cancel(&conv.id).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut interrupted = false;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(BusEvent::StreamingComplete {
                    interrupted: true, ..
                })) => {
                    interrupted = true;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(interrupted, "no interrupted completion within 5s");

        wait_until(|| db.get_run(&run_id).unwrap().status == RunStatus::Cancelled).await;
        assert_eq!(
            db.get_session(&session_id).unwrap().status,
            SessionStatus::Interrupted
        );
        assert!(!db.get_conversation(&conv.id).unwrap().is_streaming);

        // A fresh send starts cleanly afterwards
        let next = scheduler.send_message(send(&conv, "again", "k2")).await.unwrap();
        assert!(matches!(next, SendOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn cancel_without_active_execution_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 0,
            hold: None,
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db, bus, Arc::new(runner));
        assert!(matches!(
            scheduler.cancel(&conv.id),
            Err(SchedulerError::NoActiveExecution(_))
        ));
    }

    #[tokio::test]
    async fn queue_overflow_is_resource_exhausted() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let hold = Arc::new(Notify::new());
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 0,
            hold: Some(Arc::clone(&hold)),
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::with_queue_cap(db.clone(), bus, Arc::new(runner), 1);

        scheduler.send_message(send(&conv, "a", "k1")).await.unwrap();
        scheduler.send_message(send(&conv, "b", "k2")).await.unwrap();
        let third = scheduler.send_message(send(&conv, "c", "k3")).await;
        assert!(matches!(third, Err(SchedulerError::QueueFull(_))));
        hold.notify_one();
    }

    #[tokio::test]
    async fn cancel_run_removes_queued_turn() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let hold = Arc::new(Notify::new());
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 0,
            hold: Some(Arc::clone(&hold)),
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus.clone(), Arc::new(runner));

        scheduler.send_message(send(&conv, "a", "k1")).await.unwrap();
        let queued = scheduler.send_message(send(&conv, "b", "k2")).await.unwrap();
        let SendOutcome::Queued { run_id, .. } = queued else {
            panic!("expected queued");
        };

        let run = scheduler.cancel_run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(scheduler.queue_snapshot(&conv.id).is_empty());

        // Cancelling it again conflicts (terminal state)
        assert!(matches!(
            scheduler.cancel_run(&run_id),
            Err(SchedulerError::Db(DbError::Conflict(_)))
        ));
        hold.notify_one();
    }

    #[tokio::test]
    async fn recover_requeues_pending_runs() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        // A pending run left behind by a previous process
        let run = db
            .create_run(
                "claude-code",
                Some(&conv.id),
                &RunInput {
                    content: "resume me".to_string(),
                    config: None,
                },
                None,
            )
            .unwrap();

        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 1,
            hold: None,
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus, Arc::new(runner));
        scheduler.recover().await.unwrap();

        wait_until(|| db.get_run(&run.id).unwrap().status == RunStatus::Success).await;
    }

    #[tokio::test]
    async fn update_queued_rewrites_content() {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let conv = db
            .create_conversation("claude-code", "test", None, None, None)
            .unwrap();
        let hold = Arc::new(Notify::new());
        let runner = ScriptedRunner {
            persister: StreamPersister::new(db.clone(), bus.clone()),
            chunks: 0,
            hold: Some(Arc::clone(&hold)),
            outcome: || Ok(TurnOutcome::Success { final_text: None }),
            wait_for_cancel: false,
        };
        let scheduler = RunScheduler::new(db.clone(), bus, Arc::new(runner));

        scheduler.send_message(send(&conv, "a", "k1")).await.unwrap();
        let queued = scheduler.send_message(send(&conv, "b", "k2")).await.unwrap();
        let SendOutcome::Queued { message, .. } = queued else {
            panic!("expected queued");
        };

        let updated = scheduler
            .update_queued(&conv.id, &message.id, "b-edited")
            .unwrap();
        assert_eq!(updated.content, "b-edited");
        assert_eq!(scheduler.queue_snapshot(&conv.id)[0].content, "b-edited");
        hold.notify_one();
    }
}
