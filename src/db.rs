//! Durable store for conversations, messages, sessions, runs and the
//! per-session chunk log.
//!
//! Single embedded SQLite file under the data directory. Every public
//! operation is one logical transaction; per-session chunk sequence numbers
//! are assigned atomically inside `create_chunk`.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Run not found: {0}")]
    RunNotFound(String),
    #[error("{0}")]
    Conflict(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Maximum page size for `list_messages`.
const MAX_MESSAGE_PAGE: i64 = 100;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation
    pub fn create_conversation(
        &self,
        agent_id: &str,
        title: &str,
        cwd: Option<&str>,
        model: Option<&str>,
        sub_agent: Option<&str>,
    ) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO conversations (id, title, agent_id, model, sub_agent, cwd, status, is_streaming, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'idle', 0, ?7, ?7)",
            params![id, title, agent_id, model, sub_agent, cwd, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            id,
            title: title.to_string(),
            agent_id: agent_id.to_string(),
            model: model.map(String::from),
            sub_agent: sub_agent.map(String::from),
            cwd: cwd.map(String::from),
            status: ConversationStatus::Idle,
            is_streaming: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, agent_id, model, sub_agent, cwd, status, is_streaming, created_at, updated_at
             FROM conversations WHERE id = ?1",
        )?;

        stmt.query_row(params![id], parse_conversation_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::ConversationNotFound(id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List all conversations, most recently updated first
    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, agent_id, model, sub_agent, cwd, status, is_streaming, created_at, updated_at
             FROM conversations ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map([], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Apply a client-supplied patch
    pub fn update_conversation(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> DbResult<Conversation> {
        {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now();

            let updated = conn.execute(
                "UPDATE conversations SET
                     title = COALESCE(?1, title),
                     model = COALESCE(?2, model),
                     sub_agent = COALESCE(?3, sub_agent),
                     cwd = COALESCE(?4, cwd),
                     updated_at = ?5
                 WHERE id = ?6",
                params![
                    patch.title,
                    patch.model,
                    patch.sub_agent,
                    patch.cwd,
                    now.to_rfc3339(),
                    id
                ],
            )?;

            if updated == 0 {
                return Err(DbError::ConversationNotFound(id.to_string()));
            }
        }
        self.get_conversation(id)
    }

    /// Set the live-execution flags. Only the scheduler calls this.
    pub fn set_conversation_live(
        &self,
        id: &str,
        status: ConversationStatus,
        is_streaming: bool,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE conversations SET status = ?1, is_streaming = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), is_streaming, now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a conversation and everything under it.
    ///
    /// Rejected while any run on this thread is still pending or active.
    pub fn delete_conversation(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();

        let live: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE thread_id = ?1 AND status IN ('pending', 'active')",
            params![id],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(DbError::Conflict(format!(
                "conversation {id} has {live} non-terminal run(s)"
            )));
        }

        // Messages, sessions and chunks are removed by CASCADE
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        conn.execute("DELETE FROM runs WHERE thread_id = ?1", params![id])?;
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message.
    ///
    /// When `idempotency_key` collides with an existing message in the same
    /// conversation, the existing row is returned unchanged.
    pub fn create_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        idempotency_key: Option<&str>,
    ) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
            params![conversation_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        if let Some(key) = idempotency_key {
            let existing = conn
                .query_row(
                    "SELECT id, conversation_id, role, content, idempotency_key, created_at
                     FROM messages WHERE conversation_id = ?1 AND idempotency_key = ?2",
                    params![conversation_id, key],
                    parse_message_row,
                )
                .optional()?;
            if let Some(msg) = existing {
                return Ok(msg);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, idempotency_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                conversation_id,
                role.to_string(),
                content,
                idempotency_key,
                now.to_rfc3339()
            ],
        )?;

        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            idempotency_key: idempotency_key.map(String::from),
            created_at: now,
        })
    }

    /// Look up a message by its idempotency key within one conversation.
    pub fn find_message_by_idempotency(
        &self,
        conversation_id: &str,
        key: &str,
    ) -> DbResult<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, conversation_id, role, content, idempotency_key, created_at
             FROM messages WHERE conversation_id = ?1 AND idempotency_key = ?2",
            params![conversation_id, key],
            parse_message_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Paginated message listing in creation order. `limit` is clamped to 100.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let limit = limit.clamp(1, MAX_MESSAGE_PAGE);
        let offset = offset.max(0);

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, idempotency_key, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit, offset], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get a message by ID
    pub fn get_message(&self, id: &str) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, conversation_id, role, content, idempotency_key, created_at
             FROM messages WHERE id = ?1",
            params![id],
            parse_message_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::MessageNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Count messages in a conversation
    pub fn count_messages(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    // ==================== Session Operations ====================

    /// Create a session in `pending` status
    pub fn create_session(&self, conversation_id: &str, agent_id: &str) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO sessions (id, conversation_id, agent_id, status, started_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, conversation_id, agent_id, now.to_rfc3339()],
        )?;

        Ok(Session {
            id,
            conversation_id: conversation_id.to_string(),
            agent_id: agent_id.to_string(),
            status: SessionStatus::Pending,
            error: None,
            started_at: now,
            completed_at: None,
        })
    }

    /// Get a session by ID
    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, conversation_id, agent_id, status, error, started_at, completed_at
             FROM sessions WHERE id = ?1",
            params![id],
            parse_session_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Apply a session patch (status, error, completion stamp)
    pub fn update_session(&self, id: &str, patch: &SessionPatch) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let completed_at = patch.completed.then(|| Utc::now().to_rfc3339());

        let updated = conn.execute(
            "UPDATE sessions SET
                 status = COALESCE(?1, status),
                 error = COALESCE(?2, error),
                 completed_at = COALESCE(?3, completed_at)
             WHERE id = ?4",
            params![
                patch.status.map(|s| s.to_string()),
                patch.error,
                completed_at,
                id
            ],
        )?;

        if updated == 0 {
            return Err(DbError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Chunk Operations ====================

    /// Persist one agent event. Assigns the next per-session sequence
    /// atomically: sequences start at 0 and are gap-free within a session.
    pub fn create_chunk(
        &self,
        session_id: &str,
        conversation_id: &str,
        chunk_type: &str,
        payload: &serde_json::Value,
    ) -> DbResult<Chunk> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        let sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), -1) + 1 FROM chunks WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        let payload_str = payload.to_string();
        conn.execute(
            "INSERT INTO chunks (id, session_id, conversation_id, sequence, chunk_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                session_id,
                conversation_id,
                sequence,
                chunk_type,
                payload_str,
                now.to_rfc3339()
            ],
        )?;

        Ok(Chunk {
            id,
            session_id: session_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence,
            chunk_type: chunk_type.to_string(),
            payload: payload.clone(),
            created_at: now,
        })
    }

    /// Chunk log for a conversation, optionally restricted to chunks created
    /// at or after `since`. Ordered by creation then sequence so a refreshing
    /// client replays sessions in the order they ran.
    pub fn list_chunks(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> DbResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();
        let since = since.map_or_else(String::new, |t| t.to_rfc3339());

        let mut stmt = conn.prepare(
            "SELECT id, session_id, conversation_id, sequence, chunk_type, payload, created_at
             FROM chunks WHERE conversation_id = ?1 AND (?2 = '' OR created_at >= ?2)
             ORDER BY created_at ASC, sequence ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id, since], parse_chunk_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Chunk log for a single session, in sequence order.
    pub fn list_session_chunks(&self, session_id: &str) -> DbResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, conversation_id, sequence, chunk_type, payload, created_at
             FROM chunks WHERE session_id = ?1 ORDER BY sequence ASC",
        )?;

        let rows = stmt.query_map(params![session_id], parse_chunk_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Run Operations ====================

    /// Create a run in `pending` status
    pub fn create_run(
        &self,
        agent_id: &str,
        thread_id: Option<&str>,
        input: &RunInput,
        webhook_url: Option<&str>,
    ) -> DbResult<Run> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let input_str = serde_json::to_string(input).unwrap_or_default();

        conn.execute(
            "INSERT INTO runs (id, agent_id, thread_id, input, webhook_url, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            params![id, agent_id, thread_id, input_str, webhook_url, now.to_rfc3339()],
        )?;

        Ok(Run {
            id,
            agent_id: agent_id.to_string(),
            thread_id: thread_id.map(String::from),
            input: input.clone(),
            webhook_url: webhook_url.map(String::from),
            status: RunStatus::Pending,
            created_at: now,
            completed_at: None,
        })
    }

    /// Get a run by ID
    pub fn get_run(&self, id: &str) -> DbResult<Run> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, agent_id, thread_id, input, webhook_url, status, created_at, completed_at
             FROM runs WHERE id = ?1",
            params![id],
            parse_run_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// Advance the run state machine. Conflict when the transition is not
    /// admitted (terminal states never re-transition).
    pub fn update_run_status(&self, id: &str, next: RunStatus) -> DbResult<Run> {
        {
            let conn = self.conn.lock().unwrap();
            let current: String = conn
                .query_row("SELECT status FROM runs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
                    other => DbError::Sqlite(other),
                })?;

            let current = RunStatus::parse(&current);
            if !current.can_transition_to(next) {
                return Err(DbError::Conflict(format!(
                    "run {id} cannot transition {current} -> {next}"
                )));
            }

            let completed_at = next.is_terminal().then(|| Utc::now().to_rfc3339());
            conn.execute(
                "UPDATE runs SET status = ?1, completed_at = COALESCE(?2, completed_at) WHERE id = ?3",
                params![next.to_string(), completed_at, id],
            )?;
        }
        self.get_run(id)
    }

    /// Cancel a run. Conflict in terminal states.
    pub fn cancel_run(&self, id: &str) -> DbResult<Run> {
        self.update_run_status(id, RunStatus::Cancelled)
    }

    /// Delete a run record. Conflict while non-terminal.
    pub fn delete_run(&self, id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let current: String = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })?;

        if !RunStatus::parse(&current).is_terminal() {
            return Err(DbError::Conflict(format!("run {id} is still {current}")));
        }

        conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Search runs by status / agent / thread, newest first.
    pub fn search_runs(&self, filter: &RunFilter) -> DbResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, thread_id, input, webhook_url, status, created_at, completed_at
             FROM runs
             WHERE (?1 = '' OR status = ?1)
               AND (?2 = '' OR agent_id = ?2)
               AND (?3 = '' OR thread_id = ?3)
             ORDER BY created_at DESC",
        )?;

        let status = filter.status.map_or_else(String::new, |s| s.to_string());
        let agent = filter.agent_id.clone().unwrap_or_default();
        let thread = filter.thread_id.clone().unwrap_or_default();

        let rows = stmt.query_map(params![status, agent, thread], parse_run_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Pending runs with a thread, oldest first. Used to rebuild the
    /// per-conversation queues at startup.
    pub fn list_pending_runs(&self) -> DbResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, thread_id, input, webhook_url, status, created_at, completed_at
             FROM runs WHERE status = 'pending' AND thread_id IS NOT NULL
             ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], parse_run_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Startup Recovery ====================

    /// Reconcile rows left behind by a previous process: no execution
    /// survives a restart, so active sessions become interrupted, active
    /// runs become errors, and every conversation returns to idle.
    pub fn reset_live_state(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "UPDATE sessions SET status = 'interrupted', completed_at = ?1
             WHERE status IN ('pending', 'active')",
            params![now],
        )?;
        conn.execute(
            "UPDATE runs SET status = 'error', completed_at = ?1 WHERE status = 'active'",
            params![now],
        )?;
        conn.execute(
            "UPDATE conversations SET status = 'idle', is_streaming = 0
             WHERE status != 'idle' OR is_streaming = 1",
            [],
        )?;
        Ok(())
    }
}

// ==================== Row Parsers ====================

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        agent_id: row.get(2)?,
        model: row.get(3)?,
        sub_agent: row.get(4)?,
        cwd: row.get(5)?,
        status: ConversationStatus::parse(&row.get::<_, String>(6)?),
        is_streaming: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        idempotency_key: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        agent_id: row.get(2)?,
        status: SessionStatus::parse(&row.get::<_, String>(3)?),
        error: row.get(4)?,
        started_at: parse_datetime(&row.get::<_, String>(5)?),
        completed_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_datetime(&s)),
    })
}

fn parse_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let payload_str: String = row.get(5)?;
    Ok(Chunk {
        id: row.get(0)?,
        session_id: row.get(1)?,
        conversation_id: row.get(2)?,
        sequence: row.get(3)?,
        chunk_type: row.get(4)?,
        payload: serde_json::from_str(&payload_str).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let input_str: String = row.get(3)?;
    let input: RunInput = serde_json::from_str(&input_str).unwrap_or(RunInput {
        content: String::new(),
        config: None,
    });
    Ok(Run {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        thread_id: row.get(2)?,
        input,
        webhook_url: row.get(4)?,
        status: RunStatus::parse(&row.get::<_, String>(5)?),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        completed_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_datetime(&s)),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_with_conversation() -> (Database, Conversation) {
        let db = Database::open_in_memory().unwrap();
        let conv = db
            .create_conversation("claude-code", "test", Some("/tmp"), None, None)
            .unwrap();
        (db, conv)
    }

    #[test]
    fn create_and_get_conversation() {
        let (db, conv) = db_with_conversation();
        assert_eq!(conv.agent_id, "claude-code");
        assert_eq!(conv.status, ConversationStatus::Idle);
        assert!(!conv.is_streaming);

        let fetched = db.get_conversation(&conv.id).unwrap();
        assert_eq!(fetched.id, conv.id);
        assert_eq!(fetched.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn get_missing_conversation_is_typed_absence() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_conversation("nope"),
            Err(DbError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn update_conversation_patch_merges() {
        let (db, conv) = db_with_conversation();
        let patch = ConversationPatch {
            title: Some("renamed".to_string()),
            model: Some("opus".to_string()),
            ..ConversationPatch::default()
        };
        let updated = db.update_conversation(&conv.id, &patch).unwrap();
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.model.as_deref(), Some("opus"));
        // Untouched fields survive
        assert_eq!(updated.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn idempotent_message_insertion() {
        let (db, conv) = db_with_conversation();

        let first = db
            .create_message(&conv.id, MessageRole::User, "ping", Some("k1"))
            .unwrap();
        let second = db
            .create_message(&conv.id, MessageRole::User, "ping", Some("k1"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.count_messages(&conv.id).unwrap(), 1);

        // Same key in another conversation is a fresh message
        let other = db
            .create_conversation("claude-code", "other", None, None, None)
            .unwrap();
        let third = db
            .create_message(&other.id, MessageRole::User, "ping", Some("k1"))
            .unwrap();
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn message_pagination_clamps_limit() {
        let (db, conv) = db_with_conversation();
        for i in 0..5 {
            db.create_message(&conv.id, MessageRole::User, &format!("m{i}"), None)
                .unwrap();
        }

        let page = db.list_messages(&conv.id, 500, 0).unwrap();
        assert_eq!(page.len(), 5);

        let page = db.list_messages(&conv.id, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m2");
    }

    #[test]
    fn chunk_sequences_start_at_zero_and_are_gap_free() {
        let (db, conv) = db_with_conversation();
        let session = db.create_session(&conv.id, "claude-code").unwrap();

        for i in 0..4 {
            let chunk = db
                .create_chunk(&session.id, &conv.id, "text", &json!({"n": i}))
                .unwrap();
            assert_eq!(chunk.sequence, i);
        }

        let chunks = db.list_session_chunks(&session.id).unwrap();
        let seqs: Vec<i64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);

        // A second session starts its own sequence at 0
        let s2 = db.create_session(&conv.id, "claude-code").unwrap();
        let chunk = db
            .create_chunk(&s2.id, &conv.id, "system", &json!({}))
            .unwrap();
        assert_eq!(chunk.sequence, 0);
    }

    #[test]
    fn list_chunks_since_filters_by_created_at() {
        let (db, conv) = db_with_conversation();
        let session = db.create_session(&conv.id, "claude-code").unwrap();
        db.create_chunk(&session.id, &conv.id, "text", &json!({"a": 1}))
            .unwrap();

        let all = db.list_chunks(&conv.id, None).unwrap();
        assert_eq!(all.len(), 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = db.list_chunks(&conv.id, Some(future)).unwrap();
        assert!(none.is_empty());

        let past = Utc::now() - chrono::Duration::hours(1);
        let since = db.list_chunks(&conv.id, Some(past)).unwrap();
        assert_eq!(since.len(), 1);
    }

    #[test]
    fn run_state_machine_enforced() {
        let (db, conv) = db_with_conversation();
        let input = RunInput {
            content: "go".to_string(),
            config: None,
        };
        let run = db
            .create_run("claude-code", Some(&conv.id), &input, None)
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let run = db.update_run_status(&run.id, RunStatus::Active).unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert!(run.completed_at.is_none());

        let run = db.update_run_status(&run.id, RunStatus::Success).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.completed_at.is_some());

        // Terminal: cancel conflicts
        assert!(matches!(db.cancel_run(&run.id), Err(DbError::Conflict(_))));
        // Terminal: no reverse transition
        assert!(matches!(
            db.update_run_status(&run.id, RunStatus::Active),
            Err(DbError::Conflict(_))
        ));
    }

    #[test]
    fn cancel_pending_run_is_allowed() {
        let (db, conv) = db_with_conversation();
        let input = RunInput {
            content: "go".to_string(),
            config: None,
        };
        let run = db
            .create_run("claude-code", Some(&conv.id), &input, None)
            .unwrap();
        let run = db.cancel_run(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[test]
    fn delete_conversation_conflicts_while_run_live() {
        let (db, conv) = db_with_conversation();
        let input = RunInput {
            content: "go".to_string(),
            config: None,
        };
        let run = db
            .create_run("claude-code", Some(&conv.id), &input, None)
            .unwrap();

        assert!(matches!(
            db.delete_conversation(&conv.id),
            Err(DbError::Conflict(_))
        ));

        db.cancel_run(&run.id).unwrap();
        db.delete_conversation(&conv.id).unwrap();
        assert!(matches!(
            db.get_conversation(&conv.id),
            Err(DbError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn search_runs_filters() {
        let (db, conv) = db_with_conversation();
        let input = RunInput {
            content: "go".to_string(),
            config: None,
        };
        let r1 = db
            .create_run("claude-code", Some(&conv.id), &input, None)
            .unwrap();
        db.create_run("codex", None, &input, None).unwrap();
        db.cancel_run(&r1.id).unwrap();

        let cancelled = db
            .search_runs(&RunFilter {
                status: Some(RunStatus::Cancelled),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, r1.id);

        let codex = db
            .search_runs(&RunFilter {
                agent_id: Some("codex".to_string()),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(codex.len(), 1);
    }

    #[test]
    fn reset_live_state_reconciles_after_crash() {
        let (db, conv) = db_with_conversation();
        let session = db.create_session(&conv.id, "claude-code").unwrap();
        db.update_session(
            &session.id,
            &SessionPatch {
                status: Some(SessionStatus::Active),
                ..SessionPatch::default()
            },
        )
        .unwrap();
        let input = RunInput {
            content: "go".to_string(),
            config: None,
        };
        let run = db
            .create_run("claude-code", Some(&conv.id), &input, None)
            .unwrap();
        db.update_run_status(&run.id, RunStatus::Active).unwrap();
        db.set_conversation_live(&conv.id, ConversationStatus::Busy, true)
            .unwrap();

        db.reset_live_state().unwrap();

        assert_eq!(
            db.get_session(&session.id).unwrap().status,
            SessionStatus::Interrupted
        );
        assert_eq!(db.get_run(&run.id).unwrap().status, RunStatus::Error);
        let conv = db.get_conversation(&conv.id).unwrap();
        assert_eq!(conv.status, ConversationStatus::Idle);
        assert!(!conv.is_streaming);
    }
}
